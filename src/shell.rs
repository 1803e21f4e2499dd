// Copyright 2020 Joyent, Inc.

//! Run loops for workers written as a [`Bolt`] or a [`Spout`].
//!
//! The loops own the protocol chores: the handshake, answering heartbeats,
//! handing a spout's turn back with `sync` and skipping frames that fail to
//! decode. They return once the engine closes the stream, or with the first
//! fatal error.

use serde::de::DeserializeOwned;
use slog::{debug, error, warn, Logger};

use crate::conn::{BoltConn, SpoutConn};
use crate::content::ContentMut;
use crate::error::Error;
use crate::messages::{Command, TupleMetadata};

/// The typed contents of an incoming tuple.
///
/// Implemented for tuples of up to four deserializable values, and for `()`
/// when a bolt only looks at tuple metadata.
pub trait Fields: Default {
    fn slots(&mut self) -> Vec<&mut dyn ContentMut>;
}

impl Fields for () {
    fn slots(&mut self) -> Vec<&mut dyn ContentMut> {
        Vec::new()
    }
}

macro_rules! impl_fields {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name),+> Fields for ($($name,)+)
        where
            $($name: DeserializeOwned + Default),+
        {
            fn slots(&mut self) -> Vec<&mut dyn ContentMut> {
                vec![$(&mut self.$idx as &mut dyn ContentMut),+]
            }
        }
    };
}

impl_fields!(A: 0);
impl_fields!(A: 0, B: 1);
impl_fields!(A: 0, B: 1, C: 2);
impl_fields!(A: 0, B: 1, C: 2, D: 3);

pub trait Bolt {
    type Fields: Fields;

    /// Called once, after the handshake.
    fn prepare(&mut self, _conn: &mut BoltConn) -> Result<(), Error> {
        Ok(())
    }

    fn execute(
        &mut self,
        conn: &mut BoltConn,
        meta: &TupleMetadata,
        fields: Self::Fields,
    ) -> Result<(), Error>;

    fn cleanup(&mut self) {}
}

pub trait Spout {
    /// Called once, after the handshake.
    fn open(&mut self, _conn: &mut SpoutConn) -> Result<(), Error> {
        Ok(())
    }

    fn next_tuple(&mut self, conn: &mut SpoutConn) -> Result<(), Error>;

    fn ack(&mut self, _conn: &mut SpoutConn, _id: &str) -> Result<(), Error> {
        Ok(())
    }

    fn fail(&mut self, _conn: &mut SpoutConn, _id: &str) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) {}
}

fn skip_recoverable(log: &Logger, what: &str, e: Error) -> Result<(), Error> {
    if e.is_fatal() {
        error!(log, "stopping"; "during" => what, "err" => %e);
        return Err(e);
    }
    warn!(log, "skipping message"; "during" => what, "err" => %e);
    Ok(())
}

pub fn run_bolt<B: Bolt>(bolt: &mut B, conn: &mut BoltConn) -> Result<(), Error> {
    if !conn.session().is_connected() {
        conn.connect()?;
    }
    let result = bolt.prepare(conn).and_then(|_| bolt_loop(bolt, conn));
    bolt.cleanup();
    conn.close();
    result
}

fn bolt_loop<B: Bolt>(bolt: &mut B, conn: &mut BoltConn) -> Result<(), Error> {
    let log = conn.session().logger().clone();
    loop {
        let mut fields = B::Fields::default();
        let tuple = {
            let mut slots = fields.slots();
            conn.read_tuple(&mut slots)
        };
        let meta = match tuple {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(()),
            Err(e) => {
                skip_recoverable(&log, "read tuple", e)?;
                continue;
            }
        };

        if meta.is_heartbeat() {
            debug!(log, "answering heartbeat");
            conn.send_sync()?;
            continue;
        }
        if let Err(e) = bolt.execute(conn, &meta, fields) {
            skip_recoverable(&log, "execute", e)?;
        }
    }
}

pub fn run_spout<S: Spout>(spout: &mut S, conn: &mut SpoutConn) -> Result<(), Error> {
    if !conn.session().is_connected() {
        conn.connect()?;
    }
    let result = spout.open(conn).and_then(|_| spout_loop(spout, conn));
    spout.close();
    conn.close();
    result
}

fn spout_loop<S: Spout>(spout: &mut S, conn: &mut SpoutConn) -> Result<(), Error> {
    let log = conn.session().logger().clone();
    loop {
        let control = match conn.read_control() {
            Ok(Some(control)) => control,
            Ok(None) => return Ok(()),
            Err(e) => {
                skip_recoverable(&log, "read control", e)?;
                conn.send_sync()?;
                continue;
            }
        };

        let result = match (control.command, control.id) {
            (Command::Next, _) => spout.next_tuple(conn),
            (Command::Ack, Some(id)) => spout.ack(conn, &id),
            (Command::Fail, Some(id)) => spout.fail(conn, &id),
            (command, id) => {
                warn!(log, "ignoring unexpected control message";
                    "command" => %command, "id" => ?id);
                Ok(())
            }
        };
        if let Err(e) = result {
            skip_recoverable(&log, "spout callback", e)?;
        }
        conn.send_sync()?;
    }
}
