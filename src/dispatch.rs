/*!
 * Command Dispatcher
 *
 * Maps an upper-cased command name to a handler and drives each request
 * through the same steps:
 *
 *   validate arity → run the store operation → append the log record
 *   (live requests only) → encode the reply
 *
 * Live traffic and log replay go through one handler table, so whatever
 * a command did live is exactly what replay does again.
 *
 * Mutating commands hold a write-order lock from the store change through
 * the log append, so records land in the log in the order they were
 * applied. Reads never take it.
 */

use crate::aof::{Aof, ReplaySink};
use crate::config::Config;
use crate::error::{AofError, CommandError, DispatchError, WrongType};
use crate::protocol::Frame;
use crate::storage::{AHash, Store};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Handler signature: arguments exclude the command name
type Handler = fn(&Store, &[Bytes]) -> Result<Effect, Reject>;

/// Accepted argument counts, not counting the command name
#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

struct CommandDef {
    name: &'static str,
    arity: Arity,
    /// Whether the command may change the store and emit log records
    writes: bool,
    handler: Handler,
}

/// What a handler produced: the reply, plus the records to log if it mutated anything
struct Effect {
    reply: Frame,
    records: Vec<Frame>,
}

impl Effect {
    fn read(reply: Frame) -> Self {
        Self { reply, records: Vec::new() }
    }

    fn write(reply: Frame, record: Frame) -> Self {
        Self { reply, records: vec![record] }
    }
}

/// Why a handler refused a request; becomes an error reply
#[derive(Debug, Error)]
enum Reject {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    WrongType(#[from] WrongType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live,
    Replay,
}

/// Command registry bound to one store and (optionally) one log
pub struct Dispatcher {
    store: Store,
    aof: Option<Aof>,
    /// Serializes mutate-then-append for logged writes
    write_order: Mutex<()>,
    table: HashMap<&'static str, CommandDef, AHash>,
}

impl Dispatcher {
    /// Wrap an existing store and log
    pub fn new(store: Store, aof: Option<Aof>) -> Self {
        Self { store, aof, write_order: Mutex::new(()), table: command_table() }
    }

    /// A dispatcher with an empty store and no persistence
    pub fn in_memory() -> Self {
        Self::new(Store::new(), None)
    }

    /// Rebuild the store from the configured log, then enable appending
    ///
    /// The dispatcher is returned only after the full log has been
    /// replayed, so no client can observe a half-recovered store.
    pub fn open(config: &Config) -> Result<Self, AofError> {
        let mut dispatcher = Self::in_memory();
        if let Some(path) = &config.aof_path {
            let aof = Aof::replay(path, config.fsync, &mut dispatcher)?;
            dispatcher.aof = Some(aof);
        } else {
            log::warn!("persistence disabled; data lives in memory only");
        }
        Ok(dispatcher)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn aof(&self) -> Option<&Aof> {
        self.aof.as_ref()
    }

    /// Execute one request frame and return the reply frame
    ///
    /// A failed log append is logged and reported to the client as an
    /// `-ERR` reply; the in-memory change stays in place.
    pub fn dispatch(&self, frame: &Frame) -> Frame {
        match self.execute(frame) {
            Ok(reply) => reply,
            Err(e) => Frame::error(format!("ERR {}", e)),
        }
    }

    /// Like `dispatch`, but hands a persistence failure back as an error
    pub fn execute(&self, frame: &Frame) -> Result<Frame, DispatchError> {
        self.run(frame, Mode::Live)
    }

    fn run(&self, frame: &Frame, mode: Mode) -> Result<Frame, DispatchError> {
        let (def, args) = match self.resolve(frame) {
            Ok(found) => found,
            Err(reject) => return Ok(Frame::error(reject.to_string())),
        };

        let aof = self.aof.as_ref().filter(|_| mode == Mode::Live && def.writes);
        let _order = aof.map(|_| self.write_order.lock());

        log::trace!("{} with {} args", def.name, args.len() - 1);
        let effect = match (def.handler)(&self.store, &args[1..]) {
            Ok(effect) => effect,
            Err(reject) => return Ok(Frame::error(reject.to_string())),
        };

        if let Some(aof) = aof {
            for record in &effect.records {
                if let Err(e) = aof.append(record) {
                    log::error!("aof append to {} failed, write not durable: {}", aof.path().display(), e);
                    return Err(e.into());
                }
            }
        }

        Ok(effect.reply)
    }

    /// Look up the command and check its arity
    ///
    /// # Returns
    /// * The table entry and the full argument list, command name included
    fn resolve(&self, frame: &Frame) -> Result<(&CommandDef, Vec<Bytes>), Reject> {
        let args = frame.to_command_args().ok_or(CommandError::MalformedFrame)?;
        let name = args.first().ok_or(CommandError::MalformedFrame)?;

        let upper = String::from_utf8_lossy(name).to_ascii_uppercase();
        let def = self
            .table
            .get(upper.as_str())
            .ok_or_else(|| CommandError::Unknown(String::from_utf8_lossy(name).into_owned()))?;

        if !def.arity.accepts(args.len() - 1) {
            return Err(CommandError::WrongArity(def.name.to_ascii_lowercase()).into());
        }
        Ok((def, args))
    }
}

impl ReplaySink for Dispatcher {
    type Error = String;

    /// Apply a log record without re-appending it
    fn apply(&mut self, record: Frame) -> Result<(), String> {
        match self.run(&record, Mode::Replay) {
            Ok(Frame::Error(msg)) => Err(msg),
            Ok(_) => Ok(()),
            // Replay never appends, so there is no persistence failure to see
            Err(e) => Err(e.to_string()),
        }
    }
}

fn command_table() -> HashMap<&'static str, CommandDef, AHash> {
    let defs = [
        CommandDef { name: "PING", arity: Arity::Between(0, 1), writes: false, handler: ping },
        CommandDef { name: "SET", arity: Arity::AtLeast(2), writes: true, handler: set },
        CommandDef { name: "GET", arity: Arity::Exact(1), writes: false, handler: get },
        CommandDef { name: "DEL", arity: Arity::AtLeast(1), writes: true, handler: del },
        CommandDef { name: "EXISTS", arity: Arity::AtLeast(1), writes: false, handler: exists },
        CommandDef { name: "TTL", arity: Arity::Exact(1), writes: false, handler: ttl },
        CommandDef { name: "HSET", arity: Arity::AtLeast(3), writes: true, handler: hset },
        CommandDef { name: "HGET", arity: Arity::Exact(2), writes: false, handler: hget },
        CommandDef { name: "HGETALL", arity: Arity::Exact(1), writes: false, handler: hgetall },
    ];
    defs.into_iter().map(|def| (def.name, def)).collect()
}

//
// Handlers
//
// Each receives the arguments after the command name, already checked
// against the table's arity.
//

fn ping(_: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    Ok(Effect::read(match args.first() {
        Some(msg) => Frame::bulk(msg.clone()),
        None => Frame::simple("PONG"),
    }))
}

/// SET key value [EX seconds | PX milliseconds]
fn set(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    let (key, value) = (&args[0], &args[1]);

    let mut expiry: Option<(&'static str, i64)> = None;
    for opt in args[2..].chunks(2) {
        let [name, amount] = opt else {
            return Err(CommandError::Syntax.into());
        };
        let unit = if name.eq_ignore_ascii_case(b"EX") {
            "EX"
        } else if name.eq_ignore_ascii_case(b"PX") {
            "PX"
        } else {
            return Err(CommandError::Syntax.into());
        };
        if expiry.is_some() {
            return Err(CommandError::Syntax.into());
        }
        expiry = Some((unit, parse_i64(amount)?));
    }

    // Non-positive lifetimes mean "no expiry"
    let expiry = expiry.filter(|&(_, n)| n > 0);
    let ttl = expiry.map(|(unit, n)| match unit {
        "EX" => Duration::from_secs(n as u64),
        _ => Duration::from_millis(n as u64),
    });

    store.set(key.clone(), value.clone(), ttl);

    let mut parts = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
    if let Some((unit, n)) = expiry {
        parts.push(Bytes::from_static(unit.as_bytes()));
        parts.push(Bytes::from(n.to_string()));
    }
    Ok(Effect::write(Frame::simple("OK"), Frame::command(parts)))
}

fn get(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    Ok(Effect::read(match store.get(&args[0]) {
        Some(v) => Frame::bulk(v),
        None => Frame::null(),
    }))
}

/// DEL key [key ...]; only keys that actually existed are logged
fn del(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    let removed: Vec<Bytes> = args.iter().filter(|k| store.delete(k)).cloned().collect();
    let reply = Frame::Integer(removed.len() as i64);

    if removed.is_empty() {
        return Ok(Effect::read(reply));
    }
    let record = Frame::command(std::iter::once(Bytes::from_static(b"DEL")).chain(removed));
    Ok(Effect::write(reply, record))
}

fn exists(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    let n = args.iter().filter(|k| store.exists(k)).count();
    Ok(Effect::read(Frame::Integer(n as i64)))
}

fn ttl(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    Ok(Effect::read(Frame::Integer(store.ttl(&args[0]).as_reply())))
}

/// HSET key field value [field value ...]
///
/// When the write creates the hash, a `DEL key` record is logged ahead of
/// the HSET. Replay re-arms TTLs relative to replay time, so a string that
/// had expired live may still be alive during replay; the DEL clears it.
fn hset(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    if args.len() % 2 != 1 {
        return Err(CommandError::WrongArity("hset".into()).into());
    }
    let key = &args[0];
    let pairs: Vec<(Bytes, Bytes)> = args[1..]
        .chunks_exact(2)
        .map(|fv| (fv[0].clone(), fv[1].clone()))
        .collect();

    let write = store.hset_many(key.clone(), pairs)?;

    let mut records = Vec::with_capacity(2);
    if write.created {
        records.push(Frame::command([Bytes::from_static(b"DEL"), key.clone()]));
    }
    records.push(Frame::command(
        std::iter::once(Bytes::from_static(b"HSET")).chain(args.iter().cloned()),
    ));
    Ok(Effect { reply: Frame::Integer(write.written as i64), records })
}

fn hget(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    Ok(Effect::read(match store.hget(&args[0], &args[1]) {
        Some(v) => Frame::bulk(v),
        None => Frame::null(),
    }))
}

/// HGETALL key: flat [field, value, ...]; empty for a missing or non-hash key
fn hgetall(store: &Store, args: &[Bytes]) -> Result<Effect, Reject> {
    let fields = store.hgetall(&args[0]).unwrap_or_default();
    let mut items = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        items.push(Frame::bulk(field));
        items.push(Frame::bulk(value));
    }
    Ok(Effect::read(Frame::array(items)))
}

fn parse_i64(b: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}
