/*!
 * Command Parser
 *
 * Turns a decoded RESP frame (a command name plus its bulk-string arguments)
 * into a typed `Command`. Arity and option grammar are validated here so the
 * handler layer (`shard.rs`) only ever sees well-formed commands.
 */

use bytes::Bytes;
use std::time::Duration;

/// A syntactically invalid frame — bad arity, an unknown option keyword, or
/// an argument that doesn't parse as the number/ID it's supposed to be.
/// None of these touch storage.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("ERR unknown command '{0}'")]
    Unknown(String),
    #[error("ERR syntax error")]
    Syntax,
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR timeout is not a float or out of range")]
    NotFloat,
    #[error("ERR value is out of range, must be positive")]
    OutOfRange,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamId,
}

/// How a `SET`'s expiry option, if any, was spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expire {
    Seconds(u64),
    Millis(u64),
}

impl Expire {
    pub fn as_duration(self) -> Duration {
        match self {
            Expire::Seconds(s) => Duration::from_secs(s),
            Expire::Millis(ms) => Duration::from_millis(ms),
        }
    }
}

/// An `XADD` id argument before it has been resolved against the stream's
/// last entry (resolution is a storage-layer concern — see §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// `*` — fully auto-generated.
    Auto,
    /// `<ms>-*` — explicit millisecond part, auto sequence.
    AutoSeq(u64),
    /// `<ms>-<seq>` — fully explicit.
    Exact(u64, u64),
}

/// One endpoint of an `XRANGE` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    /// `-` — the smallest possible id.
    Min,
    /// `+` — the largest possible id.
    Max,
    /// A bare `<ms>` with no sequence part.
    Bare(u64),
    /// A fully qualified `<ms>-<seq>`.
    Exact(u64, u64),
}

impl RangeBound {
    /// Resolve as the lower end of an `XRANGE` query.
    pub fn resolve_as_start(self) -> (u64, u64) {
        match self {
            RangeBound::Min => (0, 0),
            RangeBound::Max => (u64::MAX, u64::MAX),
            RangeBound::Bare(ms) => (ms, 0),
            RangeBound::Exact(ms, seq) => (ms, seq),
        }
    }

    /// Resolve as the upper end of an `XRANGE` query. A bare `<ms>` widens
    /// to the last sequence number in that millisecond, not the first.
    pub fn resolve_as_end(self) -> (u64, u64) {
        match self {
            RangeBound::Min => (0, 0),
            RangeBound::Max => (u64::MAX, u64::MAX),
            RangeBound::Bare(ms) => (ms, u64::MAX),
            RangeBound::Exact(ms, seq) => (ms, seq),
        }
    }
}

/// An `XREAD` cursor: entries with id strictly greater than this are
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterId {
    /// A bare `<ms>` — only strictly later millisecond buckets match.
    Bare(u64),
    Exact(u64, u64),
}

impl AfterId {
    pub fn resolve(self) -> (u64, u64) {
        match self {
            AfterId::Bare(ms) => (ms, u64::MAX),
            AfterId::Exact(ms, seq) => (ms, seq),
        }
    }
}

/// A fully parsed, arity- and grammar-checked command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        expire: Option<Expire>,
    },
    Get(Bytes),
    RPush {
        key: Bytes,
        values: Vec<Bytes>,
    },
    LPush {
        key: Bytes,
        values: Vec<Bytes>,
    },
    LRange {
        key: Bytes,
        start: i64,
        stop: i64,
    },
    LLen(Bytes),
    LPop {
        key: Bytes,
        count: Option<i64>,
    },
    BLPop {
        key: Bytes,
        timeout: Duration,
    },
    XAdd {
        key: Bytes,
        id: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    },
    XRange {
        key: Bytes,
        start: RangeBound,
        end: RangeBound,
    },
    XRead {
        streams: Vec<(Bytes, AfterId)>,
    },
    Type(Bytes),
}

/// Parse a decoded frame into a [`Command`].
///
/// `args[0]` is the command name (matched case-insensitively); the rest are
/// its arguments. An empty frame (`*0\r\n`) is a syntax error, not a
/// protocol error — the session stays open.
///
/// # Arguments
/// * `args` - the frame's bulk-string arguments, command name first
///
/// # Returns
/// * `Ok(Command)` for a well-formed frame
/// * `Err(CommandError)` for bad arity, an unknown command, or a grammar
///   failure in an option/id argument
pub fn parse(args: &[Bytes]) -> Result<Command, CommandError> {
    let name = args.first().ok_or(CommandError::Syntax)?;
    let upper = name.to_ascii_uppercase();

    match upper.as_slice() {
        b"PING" => Ok(Command::Ping),

        b"ECHO" => {
            require_arity(args, 2, "ECHO")?;
            Ok(Command::Echo(args[1].clone()))
        }

        b"SET" => {
            if args.len() == 3 {
                Ok(Command::Set {
                    key: args[1].clone(),
                    value: args[2].clone(),
                    expire: None,
                })
            } else if args.len() == 5 {
                let opt = args[3].to_ascii_uppercase();
                let n = parse_u64(&args[4]).ok_or(CommandError::NotInteger)?;
                let expire = match opt.as_slice() {
                    b"EX" => Expire::Seconds(n),
                    b"PX" => Expire::Millis(n),
                    _ => return Err(CommandError::Syntax),
                };
                Ok(Command::Set {
                    key: args[1].clone(),
                    value: args[2].clone(),
                    expire: Some(expire),
                })
            } else {
                Err(CommandError::WrongArity("SET".into()))
            }
        }

        b"GET" => {
            require_arity(args, 2, "GET")?;
            Ok(Command::Get(args[1].clone()))
        }

        b"RPUSH" => {
            require_min_arity(args, 3, "RPUSH")?;
            Ok(Command::RPush {
                key: args[1].clone(),
                values: args[2..].to_vec(),
            })
        }

        b"LPUSH" => {
            require_min_arity(args, 3, "LPUSH")?;
            Ok(Command::LPush {
                key: args[1].clone(),
                values: args[2..].to_vec(),
            })
        }

        b"LRANGE" => {
            require_arity(args, 4, "LRANGE")?;
            let start = parse_i64(&args[2]).ok_or(CommandError::NotInteger)?;
            let stop = parse_i64(&args[3]).ok_or(CommandError::NotInteger)?;
            Ok(Command::LRange {
                key: args[1].clone(),
                start,
                stop,
            })
        }

        b"LLEN" => {
            require_arity(args, 2, "LLEN")?;
            Ok(Command::LLen(args[1].clone()))
        }

        b"LPOP" => {
            if args.len() == 2 {
                Ok(Command::LPop {
                    key: args[1].clone(),
                    count: None,
                })
            } else if args.len() == 3 {
                let count = parse_i64(&args[2]).ok_or(CommandError::NotInteger)?;
                if count < 0 {
                    return Err(CommandError::OutOfRange);
                }
                Ok(Command::LPop {
                    key: args[1].clone(),
                    count: Some(count),
                })
            } else {
                Err(CommandError::WrongArity("LPOP".into()))
            }
        }

        b"BLPOP" => {
            require_arity(args, 3, "BLPOP")?;
            let secs = parse_f64(&args[2]).ok_or(CommandError::NotFloat)?;
            // `Duration::from_secs_f64` panics on NaN, infinite, negative, or
            // merely-finite-but-too-large input (e.g. `1e300`); go through
            // the fallible constructor so all of those become a normal
            // syntax error instead of aborting the process.
            let timeout = Duration::try_from_secs_f64(secs).map_err(|_| CommandError::NotFloat)?;
            Ok(Command::BLPop {
                key: args[1].clone(),
                timeout,
            })
        }

        b"XADD" => {
            require_min_arity(args, 5, "XADD")?;
            if (args.len() - 3) % 2 != 0 {
                return Err(CommandError::WrongArity("XADD".into()));
            }
            let id = parse_id_spec(&args[2])?;
            let fields = args[3..]
                .chunks_exact(2)
                .map(|c| (c[0].clone(), c[1].clone()))
                .collect();
            Ok(Command::XAdd {
                key: args[1].clone(),
                id,
                fields,
            })
        }

        b"XRANGE" => {
            require_arity(args, 4, "XRANGE")?;
            let start = parse_range_bound(&args[2])?;
            let end = parse_range_bound(&args[3])?;
            Ok(Command::XRange {
                key: args[1].clone(),
                start,
                end,
            })
        }

        b"XREAD" => {
            require_min_arity(args, 4, "XREAD")?;
            let opt = args[1].to_ascii_uppercase();
            if opt != b"STREAMS" {
                return Err(CommandError::Syntax);
            }
            let rest = &args[2..];
            if rest.len() % 2 != 0 || rest.is_empty() {
                return Err(CommandError::Syntax);
            }
            let k = rest.len() / 2;
            let mut streams = Vec::with_capacity(k);
            for i in 0..k {
                let key = rest[i].clone();
                let after = parse_after_id(&rest[k + i])?;
                streams.push((key, after));
            }
            Ok(Command::XRead { streams })
        }

        b"TYPE" => {
            require_arity(args, 2, "TYPE")?;
            Ok(Command::Type(args[1].clone()))
        }

        other => Err(CommandError::Unknown(String::from_utf8_lossy(other).into_owned())),
    }
}

fn require_arity(args: &[Bytes], n: usize, name: &str) -> Result<(), CommandError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(CommandError::WrongArity(name.to_string()))
    }
}

fn require_min_arity(args: &[Bytes], n: usize, name: &str) -> Result<(), CommandError> {
    if args.len() >= n {
        Ok(())
    } else {
        Err(CommandError::WrongArity(name.to_string()))
    }
}

fn parse_i64(b: &[u8]) -> Option<i64> {
    std::str::from_utf8(b).ok()?.parse::<i64>().ok()
}

fn parse_u64(b: &[u8]) -> Option<u64> {
    std::str::from_utf8(b).ok()?.parse::<u64>().ok()
}

fn parse_f64(b: &[u8]) -> Option<f64> {
    std::str::from_utf8(b).ok()?.parse::<f64>().ok()
}

fn parse_id_spec(b: &[u8]) -> Result<IdSpec, CommandError> {
    if b == b"*" {
        return Ok(IdSpec::Auto);
    }
    if let Some(ms_part) = b.strip_suffix(b"-*") {
        let ms = parse_u64(ms_part).ok_or(CommandError::InvalidStreamId)?;
        return Ok(IdSpec::AutoSeq(ms));
    }
    let (ms, seq) = split_ms_seq(b).ok_or(CommandError::InvalidStreamId)?;
    Ok(IdSpec::Exact(ms, seq))
}

fn parse_range_bound(b: &[u8]) -> Result<RangeBound, CommandError> {
    if b == b"-" {
        return Ok(RangeBound::Min);
    }
    if b == b"+" {
        return Ok(RangeBound::Max);
    }
    if let Some((ms, seq)) = split_ms_seq(b) {
        return Ok(RangeBound::Exact(ms, seq));
    }
    let ms = parse_u64(b).ok_or(CommandError::InvalidStreamId)?;
    Ok(RangeBound::Bare(ms))
}

fn parse_after_id(b: &[u8]) -> Result<AfterId, CommandError> {
    if let Some((ms, seq)) = split_ms_seq(b) {
        return Ok(AfterId::Exact(ms, seq));
    }
    let ms = parse_u64(b).ok_or(CommandError::InvalidStreamId)?;
    Ok(AfterId::Bare(ms))
}

/// Split a `<ms>-<seq>` byte string into its two numeric parts. Returns
/// `None` if there's no `-` (the caller treats that as a bare `<ms>`).
fn split_ms_seq(b: &[u8]) -> Option<(u64, u64)> {
    let dash = b.iter().position(|&c| c == b'-')?;
    let ms = parse_u64(&b[..dash])?;
    let seq = parse_u64(&b[dash + 1..])?;
    Some((ms, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(args: &[&[u8]]) -> Vec<Bytes> {
        args.iter().map(|a| Bytes::copy_from_slice(a)).collect()
    }

    #[test]
    fn parses_set_with_ex() {
        let cmd = parse(&f(&[b"SET", b"k", b"v", b"EX", b"10"])).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                expire: Some(Expire::Seconds(10)),
            }
        );
    }

    #[test]
    fn set_rejects_bad_option() {
        assert_eq!(
            parse(&f(&[b"SET", b"k", b"v", b"ZZ", b"10"])),
            Err(CommandError::Syntax)
        );
    }

    #[test]
    fn rejects_wrong_arity() {
        assert_eq!(
            parse(&f(&[b"GET"])),
            Err(CommandError::WrongArity("GET".into()))
        );
    }

    #[test]
    fn case_insensitive_command_name() {
        assert_eq!(parse(&f(&[b"ping"])).unwrap(), Command::Ping);
        assert_eq!(parse(&f(&[b"PiNg"])).unwrap(), Command::Ping);
    }

    #[test]
    fn xadd_requires_even_field_pairs() {
        assert!(parse(&f(&[b"XADD", b"s", b"*", b"f1", b"v1"])).is_ok());
        assert_eq!(
            parse(&f(&[b"XADD", b"s", b"*", b"f1"])),
            Err(CommandError::WrongArity("XADD".into()))
        );
    }

    #[test]
    fn xadd_id_spec_variants() {
        assert_eq!(parse_id_spec(b"*").unwrap(), IdSpec::Auto);
        assert_eq!(parse_id_spec(b"5-*").unwrap(), IdSpec::AutoSeq(5));
        assert_eq!(parse_id_spec(b"5-2").unwrap(), IdSpec::Exact(5, 2));
        assert!(parse_id_spec(b"nope").is_err());
    }

    #[test]
    fn xrange_bounds() {
        assert_eq!(parse_range_bound(b"-").unwrap(), RangeBound::Min);
        assert_eq!(parse_range_bound(b"+").unwrap(), RangeBound::Max);
        assert_eq!(parse_range_bound(b"5").unwrap(), RangeBound::Bare(5));
        assert_eq!(parse_range_bound(b"5-3").unwrap(), RangeBound::Exact(5, 3));
    }

    #[test]
    fn xread_splits_keys_and_ids() {
        let cmd = parse(&f(&[b"XREAD", b"STREAMS", b"s1", b"s2", b"0", b"0-1"])).unwrap();
        assert_eq!(
            cmd,
            Command::XRead {
                streams: vec![
                    (Bytes::from_static(b"s1"), AfterId::Bare(0)),
                    (Bytes::from_static(b"s2"), AfterId::Exact(0, 1)),
                ]
            }
        );
    }

    #[test]
    fn blpop_rejects_negative_timeout() {
        assert_eq!(
            parse(&f(&[b"BLPOP", b"k", b"-1"])),
            Err(CommandError::NotFloat)
        );
    }

    #[test]
    fn blpop_rejects_non_finite_timeout_instead_of_panicking() {
        assert_eq!(
            parse(&f(&[b"BLPOP", b"k", b"nan"])),
            Err(CommandError::NotFloat)
        );
        assert_eq!(
            parse(&f(&[b"BLPOP", b"k", b"inf"])),
            Err(CommandError::NotFloat)
        );
        assert_eq!(
            parse(&f(&[b"BLPOP", b"k", b"1e300"])),
            Err(CommandError::NotFloat)
        );
    }

    #[test]
    fn lpop_rejects_negative_count() {
        assert_eq!(
            parse(&f(&[b"LPOP", b"k", b"-1"])),
            Err(CommandError::OutOfRange)
        );
    }
}
