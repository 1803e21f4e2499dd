// Copyright 2020 Joyent, Inc.

//! Bolt and spout connections to the engine.
//!
//! Both roles share a [`Session`], which owns the codec, performs the
//! handshake and sends log messages. [`BoltConn`] and [`SpoutConn`] wrap a
//! session with the rules of their role.

use std::fs::File;
use std::io::{Read, Write};

use slog::{debug, info, o, Drain, Logger};

use crate::config::Config;
use crate::content::{Content, ContentMut};
use crate::error::Error;
use crate::messages::{Command, Context, Control, Emission, Pid, TupleMetadata};
use crate::protocol::{self, Input, Output};

pub struct Session {
    input: Box<dyn Input>,
    output: Box<dyn Output>,
    context: Option<Context>,
    need_task_ids: bool,
    log: Logger,
}

impl Session {
    pub fn new(
        input: Box<dyn Input>,
        output: Box<dyn Output>,
        need_task_ids: bool,
        log: Option<&Logger>,
    ) -> Session {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Session {
            input,
            output,
            context: None,
            need_task_ids,
            log,
        }
    }

    pub fn from_config<R, W>(
        config: &Config,
        reader: R,
        writer: W,
        log: Option<&Logger>,
    ) -> Session
    where
        R: Read + 'static,
        W: Write + 'static,
    {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("encoding" => config.encoding.to_string()));
        let (input, output) = protocol::open(config, reader, writer, &log);
        Session::new(input, output, config.need_task_ids, Some(&log))
    }

    /// Read the handshake, report our pid and drop a pid file for the
    /// engine.
    pub fn connect(&mut self) -> Result<&Context, Error> {
        if self.context.is_some() {
            return Err(Error::AlreadyConnected);
        }
        let context = match self.input.read_context() {
            Ok(Some(context)) => context,
            Ok(None) => {
                let msg = "stream ended before the handshake";
                return Err(Error::Handshake(String::from(msg)));
            }
            Err(e) => return Err(Error::Handshake(e.to_string())),
        };
        info!(self.log, "received handshake";
            "task" => context.task_id(),
            "component" => context.component().unwrap_or("unknown"),
            "pid_dir" => %context.pid_dir().display());

        self.report_pid(&context)?;
        Ok(self.context.get_or_insert(context))
    }

    fn report_pid(&mut self, context: &Context) -> Result<(), Error> {
        let pid = Pid::current();
        self.output.send_pid(pid)?;
        self.output.flush()?;

        if context.pid_dir().as_os_str().is_empty() {
            debug!(self.log, "no pid directory given, skipping pid file");
            return Ok(());
        }
        let path = context.pid_dir().join(pid.pid.to_string());
        File::create(&path).map_err(|e| Error::PidFile {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(self.log, "reported pid"; "pid" => pid.pid,
            "path" => %path.display());
        Ok(())
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    pub fn need_task_ids(&self) -> bool {
        self.need_task_ids
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.context.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Have the engine log `text`. Sent immediately.
    pub fn log(&mut self, text: &str) -> Result<(), Error> {
        self.send(&Emission::log(text), &[])?;
        self.flush()
    }

    fn send(
        &mut self,
        emission: &Emission,
        contents: &[&dyn Content],
    ) -> Result<(), Error> {
        self.ensure_connected()?;
        self.output.send_emission(emission, contents)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.output.flush()
    }

    fn emit(
        &mut self,
        emission: &Emission,
        contents: &[&dyn Content],
    ) -> Result<Option<Vec<i32>>, Error> {
        self.send(emission, contents)?;
        if emission.task != 0 || !self.need_task_ids {
            return Ok(None);
        }
        // The reply cannot arrive until the engine has seen the emit.
        self.flush()?;
        let task_ids = self.input.read_task_ids()?;
        Ok(Some(task_ids.into_inner()))
    }

    fn emission(&self, stream: &str) -> Emission {
        Emission {
            stream: stream.to_string(),
            need_task_ids: self.need_task_ids,
            ..Emission::new(Command::Emit)
        }
    }

    /// Flush pending output and release pooled buffers.
    pub fn close(&mut self) {
        if let Err(e) = self.output.flush() {
            debug!(self.log, "flush on close failed"; "err" => %e);
        }
        self.input.close();
        self.output.close();
    }
}

fn direct_task(task: i32) -> Result<i32, Error> {
    if task == 0 {
        let msg = "direct emission needs a non-zero task id";
        return Err(Error::Encode(String::from(msg)));
    }
    Ok(task)
}

fn owned(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

pub struct BoltConn {
    session: Session,
}

impl BoltConn {
    pub fn new(session: Session) -> BoltConn {
        BoltConn { session }
    }

    pub fn from_config<R, W>(
        config: &Config,
        reader: R,
        writer: W,
        log: Option<&Logger>,
    ) -> BoltConn
    where
        R: Read + 'static,
        W: Write + 'static,
    {
        BoltConn::new(Session::from_config(config, reader, writer, log))
    }

    pub fn connect(&mut self) -> Result<&Context, Error> {
        self.session.connect()
    }

    pub fn context(&self) -> Option<&Context> {
        self.session.context()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Read the next tuple, decoding its contents into `slots`.
    ///
    /// Returns `None` once the engine has closed the stream. Heartbeat
    /// tuples are returned without touching `slots`.
    pub fn read_tuple(
        &mut self,
        slots: &mut [&mut dyn ContentMut],
    ) -> Result<Option<TupleMetadata>, Error> {
        self.session.ensure_connected()?;
        let tuple = self.session.input.read_tuple(slots)?;
        if tuple.is_none() {
            info!(self.session.log, "engine closed the stream");
        }
        Ok(tuple)
    }

    pub fn ack(&mut self, id: &str) -> Result<(), Error> {
        self.session.send(&Emission::ack(id), &[])?;
        self.session.flush()
    }

    pub fn fail(&mut self, id: &str) -> Result<(), Error> {
        self.session.send(&Emission::fail(id), &[])?;
        self.session.flush()
    }

    /// Answer a heartbeat.
    pub fn send_sync(&mut self) -> Result<(), Error> {
        self.session.send(&Emission::sync(), &[])?;
        self.session.flush()
    }

    /// Emit a tuple anchored to `anchors` on `stream` ("" for the default
    /// stream). Returns the receiving task ids when they were asked for.
    pub fn emit(
        &mut self,
        anchors: &[&str],
        stream: &str,
        contents: &[&dyn Content],
    ) -> Result<Option<Vec<i32>>, Error> {
        let emission = Emission {
            anchors: owned(anchors),
            ..self.session.emission(stream)
        };
        self.session.emit(&emission, contents)
    }

    /// Emit a tuple to one task. The engine never replies with task ids.
    pub fn emit_direct(
        &mut self,
        anchors: &[&str],
        stream: &str,
        task: i32,
        contents: &[&dyn Content],
    ) -> Result<(), Error> {
        let emission = Emission {
            anchors: owned(anchors),
            task: direct_task(task)?,
            ..self.session.emission(stream)
        };
        self.session.emit(&emission, contents).map(|_| ())
    }

    pub fn log(&mut self, text: &str) -> Result<(), Error> {
        self.session.log(text)
    }

    pub fn close(&mut self) {
        self.session.close()
    }
}

/// A spout may only speak between reading a control message and sending
/// `sync`.
pub struct SpoutConn {
    session: Session,
    ready_to_send: bool,
}

impl SpoutConn {
    pub fn new(session: Session) -> SpoutConn {
        SpoutConn {
            session,
            ready_to_send: false,
        }
    }

    pub fn from_config<R, W>(
        config: &Config,
        reader: R,
        writer: W,
        log: Option<&Logger>,
    ) -> SpoutConn
    where
        R: Read + 'static,
        W: Write + 'static,
    {
        SpoutConn::new(Session::from_config(config, reader, writer, log))
    }

    pub fn connect(&mut self) -> Result<&Context, Error> {
        self.session.connect()
    }

    pub fn context(&self) -> Option<&Context> {
        self.session.context()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.ready_to_send
    }

    /// Read a `next`, `ack` or `fail` command. Returns `None` once the
    /// engine has closed the stream.
    pub fn read_control(&mut self) -> Result<Option<Control>, Error> {
        self.session.ensure_connected()?;
        match self.session.input.read_control() {
            Ok(Some(control)) => {
                self.ready_to_send = true;
                Ok(Some(control))
            }
            Ok(None) => {
                info!(self.session.log, "engine closed the stream");
                Ok(None)
            }
            Err(e) => {
                // The engine spoke, so it now waits for our sync.
                if !e.is_fatal() {
                    self.ready_to_send = true;
                }
                Err(e)
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if !self.ready_to_send {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Emit a tuple tracked under message id `id` ("" for an untracked
    /// tuple). Returns the receiving task ids when they were asked for.
    pub fn emit(
        &mut self,
        id: &str,
        stream: &str,
        contents: &[&dyn Content],
    ) -> Result<Option<Vec<i32>>, Error> {
        self.ensure_ready()?;
        let emission = Emission {
            id: id.to_string(),
            ..self.session.emission(stream)
        };
        self.session.emit(&emission, contents)
    }

    pub fn emit_direct(
        &mut self,
        id: &str,
        stream: &str,
        task: i32,
        contents: &[&dyn Content],
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let emission = Emission {
            id: id.to_string(),
            task: direct_task(task)?,
            ..self.session.emission(stream)
        };
        self.session.emit(&emission, contents).map(|_| ())
    }

    /// End this turn. No emits are allowed until the next control message.
    pub fn send_sync(&mut self) -> Result<(), Error> {
        self.session.send(&Emission::sync(), &[])?;
        self.ready_to_send = false;
        self.session.flush()
    }

    pub fn log(&mut self, text: &str) -> Result<(), Error> {
        self.session.log(text)
    }

    pub fn close(&mut self) {
        self.session.close()
    }
}
