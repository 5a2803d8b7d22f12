//! Command dispatch table and argument parsing.
//!
//! Every supported command has one entry carrying its signed arity and a
//! handler tag. Lookup is case-insensitive; names are stored lowercase and
//! incoming names are folded before the map probe.

use std::collections::HashMap;

use bytes::Bytes;

use crate::types::{ReadKind, ReadRequest, WriteKind, WriteRequest};

/// Commands answered inline without touching storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalCommand {
    Echo,
    Auth,
    Config,
    Info,
    Role,
    Ping,
    CommandList,
    Quit,
    FlushDb,
    FlushAll,
    DebugSleep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandHandler {
    Read(ReadKind),
    Write(WriteKind),
    Local(LocalCommand),
}

/// One dispatch table row. `slot` doubles as the command's metrics index.
pub struct CommandEntry {
    pub name: &'static str,
    pub arity: i32,
    pub handler: CommandHandler,
    pub slot: usize,
}

impl CommandEntry {
    /// Validate the total argument count, command name included.
    ///
    /// Positive arity demands an exact count, negative arity a minimum of
    /// `|arity|` arguments.
    pub fn check_arity(&self, argc: usize) -> Result<(), &'static str> {
        let passed = argc.saturating_sub(1);
        if self.arity < 0 {
            let min = (self.arity.unsigned_abs() as usize).saturating_sub(1);
            if passed < min {
                return Err("Too few arguments.");
            }
        } else {
            let exact = (self.arity.unsigned_abs() as usize).saturating_sub(1);
            if passed != exact {
                return Err("Wrong number of arguments.");
            }
        }
        Ok(())
    }
}

const COMMANDS: &[(&str, i32, CommandHandler)] = &[
    ("get", 2, CommandHandler::Read(ReadKind::Get)),
    ("mget", -2, CommandHandler::Read(ReadKind::MGet)),
    ("hget", 3, CommandHandler::Read(ReadKind::HGet)),
    ("tsget", 3, CommandHandler::Read(ReadKind::TsGet)),
    ("hmget", -3, CommandHandler::Read(ReadKind::HMGet)),
    ("hgetall", 2, CommandHandler::Read(ReadKind::HGetAll)),
    ("hkeys", 2, CommandHandler::Read(ReadKind::HKeys)),
    ("hvals", 2, CommandHandler::Read(ReadKind::HVals)),
    ("hlen", 2, CommandHandler::Read(ReadKind::HLen)),
    ("hexists", 3, CommandHandler::Read(ReadKind::HExists)),
    ("hstrlen", 3, CommandHandler::Read(ReadKind::HStrlen)),
    ("smembers", 2, CommandHandler::Read(ReadKind::SMembers)),
    ("sismember", 3, CommandHandler::Read(ReadKind::SIsMember)),
    ("scard", 2, CommandHandler::Read(ReadKind::SCard)),
    ("strlen", 2, CommandHandler::Read(ReadKind::Strlen)),
    ("exists", 2, CommandHandler::Read(ReadKind::Exists)),
    ("getrange", 4, CommandHandler::Read(ReadKind::GetRange)),
    ("zcard", 2, CommandHandler::Read(ReadKind::ZCard)),
    ("tsrangebytime", 4, CommandHandler::Read(ReadKind::TsRangeByTime)),
    ("zrangebyscore", -4, CommandHandler::Read(ReadKind::ZRangeByScore)),
    ("zrevrange", -4, CommandHandler::Read(ReadKind::ZRevRange)),
    ("set", -3, CommandHandler::Write(WriteKind::Set)),
    ("mset", -3, CommandHandler::Write(WriteKind::MSet)),
    ("hset", 4, CommandHandler::Write(WriteKind::HSet)),
    ("hmset", -4, CommandHandler::Write(WriteKind::HMSet)),
    ("hdel", -3, CommandHandler::Write(WriteKind::HDel)),
    ("sadd", -3, CommandHandler::Write(WriteKind::SAdd)),
    ("srem", -3, CommandHandler::Write(WriteKind::SRem)),
    ("tsadd", -4, CommandHandler::Write(WriteKind::TsAdd)),
    ("tsrem", -3, CommandHandler::Write(WriteKind::TsRem)),
    ("zrem", -3, CommandHandler::Write(WriteKind::ZRem)),
    ("zadd", -4, CommandHandler::Write(WriteKind::ZAdd)),
    ("getset", 3, CommandHandler::Write(WriteKind::GetSet)),
    ("append", 3, CommandHandler::Write(WriteKind::Append)),
    ("del", 2, CommandHandler::Write(WriteKind::Del)),
    ("setrange", 4, CommandHandler::Write(WriteKind::SetRange)),
    ("incr", 2, CommandHandler::Write(WriteKind::Incr)),
    ("echo", 2, CommandHandler::Local(LocalCommand::Echo)),
    ("auth", -1, CommandHandler::Local(LocalCommand::Auth)),
    ("config", -1, CommandHandler::Local(LocalCommand::Config)),
    ("info", -1, CommandHandler::Local(LocalCommand::Info)),
    ("role", 1, CommandHandler::Local(LocalCommand::Role)),
    ("ping", -1, CommandHandler::Local(LocalCommand::Ping)),
    ("command", -1, CommandHandler::Local(LocalCommand::CommandList)),
    ("quit", 1, CommandHandler::Local(LocalCommand::Quit)),
    ("flushdb", 1, CommandHandler::Local(LocalCommand::FlushDb)),
    ("flushall", 1, CommandHandler::Local(LocalCommand::FlushAll)),
    ("debugsleep", 2, CommandHandler::Local(LocalCommand::DebugSleep)),
];

pub struct CommandTable {
    entries: Vec<CommandEntry>,
    index: HashMap<&'static str, usize>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(COMMANDS.len());
        let mut index = HashMap::with_capacity(COMMANDS.len());
        for (slot, (name, arity, handler)) in COMMANDS.iter().enumerate() {
            entries.push(CommandEntry {
                name,
                arity: *arity,
                handler: *handler,
                slot,
            });
            index.insert(*name, slot);
        }
        Self { entries, index }
    }

    /// Find the entry for a command name, folding ASCII case.
    pub fn lookup(&self, name: &[u8]) -> Option<&CommandEntry> {
        let name = std::str::from_utf8(name).ok()?;
        let lowered = name.to_ascii_lowercase();
        self.index
            .get(lowered.as_str())
            .map(|&slot| &self.entries[slot])
    }

    /// Entry names in slot order, for the metrics registry.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the typed read request for `kind`. `args` excludes the command
/// name, so the key sits at index zero. Arity must already have passed
/// [`CommandEntry::check_arity`].
pub fn build_read(kind: ReadKind, args: &[Bytes]) -> anyhow::Result<ReadRequest> {
    let key = args[0].clone();
    let mut subkeys = Vec::new();
    let mut range = None;
    match kind {
        ReadKind::Get
        | ReadKind::HGetAll
        | ReadKind::HKeys
        | ReadKind::HVals
        | ReadKind::HLen
        | ReadKind::SMembers
        | ReadKind::SCard
        | ReadKind::Strlen
        | ReadKind::Exists
        | ReadKind::ZCard => {}
        ReadKind::HGet | ReadKind::HExists | ReadKind::HStrlen | ReadKind::SIsMember => {
            subkeys.push(args[1].clone());
        }
        ReadKind::TsGet => {
            parse_i64(&args[1])?;
            subkeys.push(args[1].clone());
        }
        ReadKind::MGet | ReadKind::HMGet => {
            subkeys.extend(args[1..].iter().cloned());
        }
        ReadKind::GetRange => {
            let start = parse_i64(&args[1])?;
            let end = parse_i64(&args[2])?;
            range = Some((start, end));
        }
        ReadKind::TsRangeByTime => {
            let low = parse_ts_bound(&args[1], true)?;
            let high = parse_ts_bound(&args[2], false)?;
            range = Some((low, high));
        }
        ReadKind::ZRangeByScore => {
            parse_score_bound(&args[1])?;
            parse_score_bound(&args[2])?;
            check_withscores(&args[3..])?;
            subkeys.extend(args[1..3].iter().cloned());
        }
        ReadKind::ZRevRange => {
            let start = parse_i64(&args[1])?;
            let stop = parse_i64(&args[2])?;
            check_withscores(&args[3..])?;
            range = Some((start, stop));
        }
    }
    Ok(ReadRequest {
        kind,
        key,
        subkeys,
        range,
    })
}

/// Build the typed write request for `kind`, validating argument shape.
/// Same contract as [`build_read`]: `args` excludes the command name.
pub fn build_write(kind: WriteKind, args: &[Bytes]) -> anyhow::Result<WriteRequest> {
    let key = args[0].clone();
    match kind {
        WriteKind::Set => {
            anyhow::ensure!(!key.is_empty(), "A SET request must have a non empty key field");
            parse_set_options(&args[2..])?;
        }
        WriteKind::MSet => {
            anyhow::ensure!(
                args.len() >= 2 && args.len() % 2 == 0,
                "wrong number of arguments for MSET"
            );
        }
        WriteKind::HMSet => {
            anyhow::ensure!(args.len() % 2 == 1, "wrong number of arguments for HMSET");
        }
        WriteKind::TsAdd => {
            anyhow::ensure!(args.len() % 2 == 1, "wrong number of arguments for TSADD");
            for pair in args[1..].chunks(2) {
                parse_i64(&pair[0])?;
            }
        }
        WriteKind::TsRem => {
            for ts in &args[1..] {
                parse_i64(ts)?;
            }
        }
        WriteKind::ZAdd => {
            anyhow::ensure!(args.len() % 2 == 1, "wrong number of arguments for ZADD");
            for pair in args[1..].chunks(2) {
                parse_score(&pair[0])?;
            }
        }
        WriteKind::SetRange => {
            let offset = parse_i64(&args[1])?;
            anyhow::ensure!(offset >= 0, "offset is out of range");
        }
        WriteKind::HSet
        | WriteKind::HDel
        | WriteKind::SAdd
        | WriteKind::SRem
        | WriteKind::ZRem
        | WriteKind::GetSet
        | WriteKind::Append
        | WriteKind::Del
        | WriteKind::Incr => {}
    }
    Ok(WriteRequest {
        kind,
        key,
        args: args[1..].to_vec(),
    })
}

/// Millisecond argument of DEBUGSLEEP.
pub fn parse_sleep_ms(raw: &[u8]) -> anyhow::Result<u64> {
    let ms = parse_i64(raw)?;
    anyhow::ensure!(ms >= 0, "sleep time must not be negative");
    Ok(ms as u64)
}

fn parse_i64(raw: &[u8]) -> anyhow::Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("value is not an integer or out of range"))
}

fn parse_score(raw: &[u8]) -> anyhow::Result<f64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| anyhow::anyhow!("value is not a valid float"))
}

/// Timestamp range bound. `+inf`/`-inf` map to the i64 extremes and a `(`
/// prefix makes the bound exclusive, which for integer timestamps is the
/// same as shifting it by one.
fn parse_ts_bound(raw: &[u8], low: bool) -> anyhow::Result<i64> {
    if raw.eq_ignore_ascii_case(b"+inf") {
        return Ok(i64::MAX);
    }
    if raw.eq_ignore_ascii_case(b"-inf") {
        return Ok(i64::MIN);
    }
    if let Some(rest) = raw.strip_prefix(b"(") {
        let ts = parse_i64(rest)?;
        return Ok(if low {
            ts.saturating_add(1)
        } else {
            ts.saturating_sub(1)
        });
    }
    parse_i64(raw)
}

fn parse_score_bound(raw: &[u8]) -> anyhow::Result<f64> {
    let raw = raw.strip_prefix(b"(").unwrap_or(raw);
    parse_score(raw)
}

fn check_withscores(rest: &[Bytes]) -> anyhow::Result<()> {
    match rest {
        [] => Ok(()),
        [flag] if flag.eq_ignore_ascii_case(b"withscores") => Ok(()),
        _ => anyhow::bail!("syntax error"),
    }
}

fn parse_set_options(options: &[Bytes]) -> anyhow::Result<()> {
    let mut i = 0;
    while i < options.len() {
        let opt = &options[i];
        if opt.eq_ignore_ascii_case(b"ex") || opt.eq_ignore_ascii_case(b"px") {
            let Some(ttl) = options.get(i + 1) else {
                anyhow::bail!("syntax error");
            };
            let ttl = parse_i64(ttl)?;
            anyhow::ensure!(ttl > 0, "invalid expire time in set");
            i += 2;
        } else if opt.eq_ignore_ascii_case(b"xx") || opt.eq_ignore_ascii_case(b"nx") {
            i += 1;
        } else {
            anyhow::bail!("syntax error");
        }
    }
    Ok(())
}
