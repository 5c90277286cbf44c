//! The command interpreter: the state machine that committed entries are
//! applied to, per spec.md §3's "interpreter" callback.
//!
//! `PersistentLog::apply_to_state_machine` decodes each committed entry's
//! argv buffer with [`crate::codec::decode_argv`] and hands it to
//! [`Interpreter::apply`]. Snapshotting round-trips through
//! `Interpreter::snapshot`/`restore` so any interpreter can opt into the
//! standard openraft snapshot transfer without `PersistentLog` knowing its
//! internal layout.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::decode_argv;
use crate::raft_types::CommandResponse;

pub trait Interpreter: Send + Sync {
    /// Applies one committed command (already-decoded argv) to the state
    /// machine, returning the reply to send back to the blocked client, if
    /// any is still waiting (spec.md §5).
    fn apply(&self, argv: &[Vec<u8>]) -> CommandResponse;

    /// Serializes the full state machine for a snapshot transfer.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the state machine's contents with a previously-taken
    /// snapshot (`install_snapshot`).
    fn restore(&self, data: &[u8]);
}

/// Decodes `data` as an argv buffer and applies it via `interp`, returning an
/// error reply instead of panicking on a malformed buffer — a corrupt entry
/// must never crash the apply loop (spec.md §7).
pub fn apply_encoded(interp: &dyn Interpreter, data: &[u8]) -> CommandResponse {
    match decode_argv(data) {
        Ok(argv) => interp.apply(&argv),
        Err(e) => CommandResponse::err(format!("malformed command entry: {e}")),
    }
}

/// A minimal in-memory key/value interpreter: `SET key value`, `GET key`,
/// `DEL key`. Reference implementation used by tests and the bootstrap
/// binary; real deployments supply their own [`Interpreter`].
#[derive(Default)]
pub struct KvInterpreter {
    store: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvInterpreter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interpreter for KvInterpreter {
    fn apply(&self, argv: &[Vec<u8>]) -> CommandResponse {
        let Some(cmd) = argv.first() else {
            return CommandResponse::err("empty command");
        };
        let mut store = self.store.lock().unwrap();
        match cmd.to_ascii_uppercase().as_slice() {
            b"SET" => match argv {
                [_, key, value] => {
                    store.insert(key.clone(), value.clone());
                    CommandResponse::ok(Vec::new())
                }
                _ => CommandResponse::err("SET requires key and value"),
            },
            b"GET" => match argv {
                [_, key] => match store.get(key) {
                    Some(v) => CommandResponse::ok(v.clone()),
                    None => CommandResponse::err("no such key"),
                },
                _ => CommandResponse::err("GET requires key"),
            },
            b"DEL" => match argv {
                [_, key] => {
                    let existed = store.remove(key).is_some();
                    CommandResponse::ok(vec![existed as u8])
                }
                _ => CommandResponse::err("DEL requires key"),
            },
            _ => CommandResponse::err("unknown command"),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let store = self.store.lock().unwrap();
        serde_json::to_vec(&*store).unwrap_or_default()
    }

    fn restore(&self, data: &[u8]) {
        let restored: HashMap<Vec<u8>, Vec<u8>> = serde_json::from_slice(data).unwrap_or_default();
        *self.store.lock().unwrap() = restored;
    }
}
