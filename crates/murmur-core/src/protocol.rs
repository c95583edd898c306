//! Text messages exchanged on the control channel.

/// Asks the peer for the current wall-clock time.
pub const REQ_TIME: &[u8] = b"REQ_TIME";
/// Announces that audio frames follow.
pub const START_V: &[u8] = b"START_V";
/// Marks the end of a recording.
pub const END: &[u8] = b"END";

/// Single-byte write on the file channel that requests the last recording.
pub const FILE_REQUEST: u8 = 0x01;

const TIME_PREFIX: &str = "TIME:";

/// A wall-clock update from the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeSync {
    /// Seconds since the Unix epoch, always positive.
    pub epoch_s: i64,
    /// Local offset from UTC in seconds.
    pub offset_s: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Inbound<'a> {
    Time(TimeSync),
    /// Free text to show as the answer.
    Reply(&'a str),
    Ignored,
}

/// Classifies one reassembled text write.
///
/// `TIME:<epoch>[:<offset minutes>]` is a time update; an epoch that is not a
/// positive integer makes the message a no-op. Anything else that is
/// non-empty after trimming is a reply.
pub fn parse_inbound(raw: &[u8]) -> Inbound<'_> {
    let Ok(text) = core::str::from_utf8(raw) else {
        return Inbound::Ignored;
    };
    let text = text.trim();

    if let Some(rest) = text.strip_prefix(TIME_PREFIX) {
        return parse_time(rest).map_or(Inbound::Ignored, Inbound::Time);
    }

    if text.is_empty() {
        Inbound::Ignored
    } else {
        Inbound::Reply(text)
    }
}

fn parse_time(rest: &str) -> Option<TimeSync> {
    let (epoch, offset) = match rest.split_once(':') {
        Some((epoch, offset)) => (epoch, Some(offset)),
        None => (rest, None),
    };

    let epoch_s = epoch.trim().parse::<i64>().ok().filter(|s| *s > 0)?;
    let offset_s = offset
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .and_then(|minutes| minutes.checked_mul(60))
        .unwrap_or(0);

    Some(TimeSync { epoch_s, offset_s })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_without_offset() {
        assert_eq!(
            parse_inbound(b"TIME:1700000000"),
            Inbound::Time(TimeSync {
                epoch_s: 1_700_000_000,
                offset_s: 0
            })
        );
    }

    #[test]
    fn time_offset_is_in_minutes() {
        assert_eq!(
            parse_inbound(b"TIME:1700000000:-90\n"),
            Inbound::Time(TimeSync {
                epoch_s: 1_700_000_000,
                offset_s: -5_400
            })
        );
    }

    #[test]
    fn bad_offset_falls_back_to_utc() {
        assert_eq!(
            parse_inbound(b"TIME:42:later"),
            Inbound::Time(TimeSync {
                epoch_s: 42,
                offset_s: 0
            })
        );
    }

    #[test]
    fn non_positive_or_garbled_epoch_is_ignored() {
        assert_eq!(parse_inbound(b"TIME:0"), Inbound::Ignored);
        assert_eq!(parse_inbound(b"TIME:-5"), Inbound::Ignored);
        assert_eq!(parse_inbound(b"TIME:soon"), Inbound::Ignored);
        assert_eq!(parse_inbound(b"TIME:"), Inbound::Ignored);
    }

    #[test]
    fn other_text_is_a_reply() {
        assert_eq!(
            parse_inbound(b"  It is sunny today.  "),
            Inbound::Reply("It is sunny today.")
        );
        assert_eq!(parse_inbound(b" \r\n"), Inbound::Ignored);
        assert_eq!(parse_inbound(&[0xff, 0xfe]), Inbound::Ignored);
    }
}
