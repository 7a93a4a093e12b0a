//! Key routing for cluster mode: hash slots, hashtags and the
//! slot-representative table.

use once_cell::sync::Lazy;
use rand::{thread_rng, Rng};

use crate::cmd::Cmd;
use crate::commands::{command_keyword, key_position, minimum_arity, KeyPosition};
use crate::types::{ErrorKind, RedisError};

/// The number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

// Slot arithmetic masks with SLOT_COUNT - 1.
const _: () = assert!(SLOT_COUNT.is_power_of_two());

pub(crate) const UNROUTABLE_ERROR: (ErrorKind, &str) = (
    ErrorKind::ClientError,
    "This command cannot be safely routed in cluster mode",
);

/// Where a command should be dispatched in a cluster.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum RoutingInfo {
    /// Fan out to every primary.
    AllMasters,
    /// Any node will do; used for keyless commands.
    Random,
    /// The primary owning this slot.
    MasterSlot(u16),
}

impl RoutingInfo {
    pub(crate) fn for_cmd(cmd: &Cmd) -> Option<RoutingInfo> {
        let keyword = command_keyword(cmd.arg_idx(0)?, cmd.arg_idx(1));
        if cmd.arg_count() < minimum_arity(&keyword) {
            return None;
        }

        match keyword.as_slice() {
            b"FLUSHALL" | b"FLUSHDB" | b"SCRIPT LOAD" | b"SCRIPT FLUSH" | b"MULTI" | b"EXEC"
            | b"DISCARD" | b"ECHO" | b"CONFIG GET" | b"CONFIG SET" | b"SLOWLOG GET" | b"DBSIZE"
            | b"LASTSAVE" | b"PING" | b"INFO" | b"BGREWRITEAOF" | b"BGSAVE" | b"SAVE" | b"TIME"
            | b"KEYS" | b"CLIENT SETNAME" => Some(RoutingInfo::AllMasters),

            keyword => match key_position(keyword) {
                KeyPosition::None => Some(RoutingInfo::Random),
                KeyPosition::Index(idx) => cmd
                    .arg_idx(idx)
                    .map(|key| RoutingInfo::MasterSlot(get_slot(key))),
                KeyPosition::Streams => {
                    let streams_position = cmd.position(b"STREAMS")?;
                    cmd.arg_idx(streams_position + 1)
                        .map(|key| RoutingInfo::MasterSlot(get_slot(key)))
                }
            },
        }
    }

    /// Resolves to the slot whose primary should serve the command; `None`
    /// means the command fans out instead of targeting one slot.
    pub(crate) fn route(self) -> Option<u16> {
        match self {
            RoutingInfo::MasterSlot(slot) => Some(slot),
            RoutingInfo::Random => Some(thread_rng().gen_range(0..SLOT_COUNT)),
            RoutingInfo::AllMasters => None,
        }
    }
}

pub(crate) fn unroutable_error() -> RedisError {
    RedisError::from(UNROUTABLE_ERROR)
}

fn get_hashtag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|v| *v == b'{')?;
    let close = key[open..].iter().position(|v| *v == b'}')?;

    let rv = &key[open + 1..open + close];
    if rv.is_empty() {
        None
    } else {
        Some(rv)
    }
}

/// Returns the hash slot that `key` maps to.
///
/// Only the substring between the first `{` and the next `}` is hashed when
/// it is non-empty; this is what lets `{user1}:a` and `{user1}:b` land on
/// one node.  The comparison is on raw bytes, never on decoded text.
pub fn get_slot(key: &[u8]) -> u16 {
    let key = match get_hashtag(key) {
        Some(tag) => tag,
        None => key,
    };
    crc16::State::<crc16::XMODEM>::calculate(key) & (SLOT_COUNT - 1)
}

// One representative key per slot, found by walking the decimal ASCII
// strings "0", "1", "2", … until every slot is covered.  Pure function of
// the hash, so computing it once per process is safe.
static SLOT_KEYS: Lazy<Vec<Vec<u8>>> = Lazy::new(|| {
    let mut table: Vec<Option<Vec<u8>>> = vec![None; SLOT_COUNT as usize];
    let mut remaining = SLOT_COUNT as usize;
    let mut candidate: u64 = 0;
    while remaining > 0 {
        let key = candidate.to_string().into_bytes();
        let slot = get_slot(&key) as usize;
        if table[slot].is_none() {
            table[slot] = Some(key);
            remaining -= 1;
        }
        candidate += 1;
    }
    table.into_iter().map(Option::unwrap).collect()
});

/// Returns a key whose hash slot is exactly `slot`.
///
/// Useful to force key placement with hashtag syntax: a key named
/// `{<representative>}suffix` is guaranteed to live in `slot`.
pub fn key_for_slot(slot: u16) -> &'static [u8] {
    &SLOT_KEYS[(slot & (SLOT_COUNT - 1)) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::cmd;

    #[test]
    fn known_slot_values() {
        assert_eq!(get_slot(b"foo"), 12182);
        assert_eq!(get_slot(b""), 0);
    }

    #[test]
    fn hashtag_forces_colocation() {
        assert_eq!(get_slot(b"{tag}x"), get_slot(b"{tag}y"));
        assert_eq!(get_slot(b"{user1}:orders"), get_slot(b"{user1}:profile"));
    }

    #[test]
    fn empty_hashtag_hashes_whole_key() {
        // "{}" has an empty tag, so the literal bytes "{}" are hashed.
        assert_eq!(get_slot(b"{}"), {
            crc16::State::<crc16::XMODEM>::calculate(b"{}") & (SLOT_COUNT - 1)
        });
        assert_ne!(get_slot(b"{}a"), get_slot(b"{}b"));
    }

    #[test]
    fn hashtag_extraction_rules() {
        assert_eq!(get_hashtag(b"foo{bar}baz"), Some(&b"bar"[..]));
        assert_eq!(get_hashtag(b"foo{}{baz}"), None);
        assert_eq!(get_hashtag(b"foo{{bar}}zap"), Some(&b"{bar"[..]));
        assert_eq!(get_hashtag(b"no-tag"), None);
    }

    #[test]
    fn slot_representatives_cover_every_slot() {
        for slot in 0..SLOT_COUNT {
            let key = key_for_slot(slot);
            assert_eq!(get_slot(key), slot, "representative for slot {slot}");
        }
    }

    #[test]
    fn representative_works_inside_a_hashtag() {
        let slot = 1234;
        let mut key = b"{".to_vec();
        key.extend_from_slice(key_for_slot(slot));
        key.extend_from_slice(b"}suffix");
        assert_eq!(get_slot(&key), slot);
    }

    #[test]
    fn routing_uses_first_key_argument() {
        let mut set = cmd("SET");
        set.arg("foo").arg("bar");
        assert_eq!(
            RoutingInfo::for_cmd(&set),
            Some(RoutingInfo::MasterSlot(12182))
        );

        let mut get = cmd("GET");
        get.arg("foo");
        assert_eq!(
            RoutingInfo::for_cmd(&get),
            Some(RoutingInfo::MasterSlot(12182))
        );
    }

    #[test]
    fn routing_scans_for_streams_marker() {
        let mut upper = cmd("XREAD");
        upper.arg("COUNT").arg(5).arg("STREAMS").arg("foo").arg(0);
        assert_eq!(
            RoutingInfo::for_cmd(&upper),
            Some(RoutingInfo::MasterSlot(12182))
        );

        let mut lower = cmd("xread");
        lower.arg("streams").arg("foo").arg(0);
        assert_eq!(
            RoutingInfo::for_cmd(&lower),
            RoutingInfo::for_cmd(&upper)
        );
    }

    #[test]
    fn xgroup_key_is_third_argument() {
        let mut xgroup = cmd("XGROUP");
        xgroup.arg("CREATE").arg("foo").arg("grp").arg("$");
        assert_eq!(
            RoutingInfo::for_cmd(&xgroup),
            Some(RoutingInfo::MasterSlot(12182))
        );
    }

    #[test]
    fn keyless_commands_route_anywhere() {
        let mut echo = cmd("ECHO");
        echo.arg("hi");
        assert_eq!(RoutingInfo::for_cmd(&echo), Some(RoutingInfo::AllMasters));
        assert!(matches!(
            RoutingInfo::for_cmd(&cmd("RANDOMKEY")),
            Some(RoutingInfo::Random)
        ));
    }

    #[test]
    fn transactions_fan_out_to_masters() {
        assert_eq!(
            RoutingInfo::for_cmd(&cmd("MULTI")),
            Some(RoutingInfo::AllMasters)
        );
    }
}
