// src/layers/queue/scripts.rs

//! Server-side Lua sources.
//!
//! Both scripts are atomic on the server: a capacity check and the push it
//! guards can never interleave with another client's push.

/// Capacity-checked push.
///
/// KEYS[1] = channel list key.
/// ARGV[1] = capacity, ARGV[2] = expiry seconds, ARGV[3] = payload.
///
/// Returns 1 on success, 0 if the channel is at capacity.
pub(super) const SEND: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[1]) then
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// Group fan-out for the members homed on this shard.
///
/// KEYS[1] = group sorted-set key.
/// ARGV[1] = live horizon (epoch seconds), ARGV[2] = capacity,
/// ARGV[3] = channel expiry seconds, ARGV[4] = channel key prefix,
/// ARGV[5] = payload.
///
/// Prunes members older than the horizon, then pushes to every surviving
/// member with room. Returns {delivered, skipped}.
pub(super) const GROUP_SEND: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local members = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], '+inf')
local delivered = 0
local skipped = 0
for _, name in ipairs(members) do
    local key = ARGV[4] .. name
    if tonumber(redis.call('LLEN', key)) < tonumber(ARGV[2]) then
        redis.call('RPUSH', key, ARGV[5])
        redis.call('EXPIRE', key, ARGV[3])
        delivered = delivered + 1
    else
        skipped = skipped + 1
    end
end
return {delivered, skipped}
"#;
