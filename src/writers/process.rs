//! Writer that pipes rows into an external loader process per node.
//!
//! The command line comes from a [`CommandTemplate`] whose `{placeholder}`s
//! are filled from the node's [`NodeConnectionInfo`] and the load's
//! [`SinkTarget`]. Rows go to the process's stdin, one per line. On
//! `finish(true)` stdin is closed and a monitor thread waits for the exit;
//! a process still running when the grace period ends is killed and the
//! writer fails with [`LoadError::SinkTimeout`].
//!
//! Once the process has exited successfully its rows are in the database.
//! Rolling back from there needs a rollback command; without one `rollback`
//! fails and the writer stays `Failed`.

use super::{Lifecycle, NodeWriter, SinkTarget, WriterFactory, WriterState};
use crate::NodeId;
use crate::error::{LoadError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufWriter, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex"));

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for stderr once the process is gone. Grandchildren that
/// inherited the pipe can keep it open long after that.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Program plus arguments, both of which may contain placeholders:
/// `{host} {port} {database} {user} {password} {table} {columns}
/// {delimiter} {null} {quote} {escape} {copy}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `psql` reading a `COPY ... FROM STDIN` for the target.
    #[must_use]
    pub fn psql() -> Self {
        Self::new(
            "psql",
            [
                "-X", "-q", "-v", "ON_ERROR_STOP=1", "-h", "{host}", "-p", "{port}", "-U",
                "{user}", "-d", "{database}", "-c", "{copy}",
            ],
        )
    }

    /// Substitute every placeholder.
    ///
    /// # Errors
    /// A placeholder with no value.
    pub fn render(&self, vars: &BTreeMap<&'static str, String>) -> Result<RenderedCommand> {
        let one = |s: &str| -> Result<String> {
            if let Some(unknown) = PLACEHOLDER
                .captures_iter(s)
                .map(|c| c[1].to_string())
                .find(|name| !vars.contains_key(name.as_str()))
            {
                return Err(LoadError::config(format!(
                    "unknown placeholder {{{unknown}}} in sink command"
                )));
            }
            Ok(PLACEHOLDER
                .replace_all(s, |c: &Captures<'_>| {
                    vars.get(&c[1]).cloned().unwrap_or_default()
                })
                .into_owned())
        };
        Ok(RenderedCommand {
            program: one(&self.program)?,
            args: self
                .args
                .iter()
                .map(|a| one(a))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// A command line with placeholders filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// How to reach one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnectionInfo {
    pub node: NodeId,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl NodeConnectionInfo {
    fn vars(&self, target: &SinkTarget) -> BTreeMap<&'static str, String> {
        let format = &target.format;
        let (quote, escape) = format
            .csv
            .as_ref()
            .map(|c| (c.quote.to_string(), c.escape.to_string()))
            .unwrap_or_default();
        BTreeMap::from([
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("database", self.database.clone()),
            ("user", self.user.clone()),
            ("password", self.password.clone().unwrap_or_default()),
            ("table", target.table.clone()),
            ("columns", target.column_list()),
            ("delimiter", format.delimiter.to_string()),
            ("null", format.null_marker.clone()),
            ("quote", quote),
            ("escape", escape),
            ("copy", target.copy_statement()),
        ])
    }
}

/// Settings of the external process sink, loadable from JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessWriterConfig {
    pub command: CommandTemplate,
    /// Run on rollback after the process already exited successfully.
    pub rollback_command: Option<CommandTemplate>,
    /// Line written after the last row on success (e.g. `\.`).
    pub footer: Option<String>,
    pub grace_period_ms: u64,
    pub nodes: Vec<NodeConnectionInfo>,
}

impl Default for ProcessWriterConfig {
    fn default() -> Self {
        Self {
            command: CommandTemplate::psql(),
            rollback_command: None,
            footer: None,
            grace_period_ms: 30_000,
            nodes: Vec::new(),
        }
    }
}

impl ProcessWriterConfig {
    /// Read sink settings from a JSON file and validate them.
    ///
    /// # Errors
    /// I/O, JSON and validation errors.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: ProcessWriterConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// # Errors
    /// An empty program, a zero grace period, or a node listed twice.
    pub fn validate(&self) -> Result<()> {
        if self.command.program.trim().is_empty() {
            return Err(LoadError::config("sink command has no program"));
        }
        if self.grace_period_ms == 0 {
            return Err(LoadError::config("grace period must be positive"));
        }
        let mut seen = BTreeSet::new();
        for n in &self.nodes {
            if !seen.insert(n.node) {
                return Err(LoadError::DuplicateNode(n.node));
            }
        }
        Ok(())
    }
}

/// Builds one [`ExternalProcessWriter`] per node from a [`ProcessWriterConfig`].
#[derive(Clone, Debug)]
pub struct ProcessWriterFactory {
    config: ProcessWriterConfig,
}

impl ProcessWriterFactory {
    /// # Errors
    /// The configuration does not validate.
    pub fn new(config: ProcessWriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl WriterFactory for ProcessWriterFactory {
    fn create(
        &self,
        node: NodeId,
        _processor: usize,
        target: &SinkTarget,
    ) -> Result<Box<dyn NodeWriter>> {
        let info = self
            .config
            .nodes
            .iter()
            .find(|n| n.node == node)
            .ok_or(LoadError::UnknownNode(node))?;
        let vars = info.vars(target);
        let rollback = self
            .config
            .rollback_command
            .as_ref()
            .map(|t| t.render(&vars))
            .transpose()?;
        Ok(Box::new(
            ExternalProcessWriter::new(node, self.config.command.render(&vars)?)
                .with_rollback(rollback)
                .with_footer(self.config.footer.clone())
                .with_grace_period(self.config.grace_period()),
        ))
    }
}

/// Writer feeding one spawned process.
pub struct ExternalProcessWriter {
    lifecycle: Lifecycle,
    command: RenderedCommand,
    rollback: Option<RenderedCommand>,
    footer: Option<String>,
    grace: Duration,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<Receiver<String>>,
    exited_ok: bool,
    rows: u64,
}

impl ExternalProcessWriter {
    #[must_use]
    pub fn new(node: NodeId, command: RenderedCommand) -> Self {
        Self {
            lifecycle: Lifecycle::new(node),
            command,
            rollback: None,
            footer: None,
            grace: Duration::from_secs(30),
            child: None,
            stdin: None,
            stderr: None,
            exited_ok: false,
            rows: 0,
        }
    }

    #[must_use]
    pub fn with_rollback(mut self, rollback: Option<RenderedCommand>) -> Self {
        self.rollback = rollback;
        self
    }

    #[must_use]
    pub fn with_footer(mut self, footer: Option<String>) -> Self {
        self.footer = footer;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn node_id(&self) -> NodeId {
        self.lifecycle.node()
    }

    fn spawn(&mut self) -> Result<()> {
        let node = self.node_id();
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                LoadError::sink(node, format!("cannot spawn {}: {e}", self.command.program))
            })?;
        self.stdin = child.stdin.take().map(BufWriter::new);
        if let Some(mut err) = child.stderr.take() {
            let (tx, rx) = mpsc::channel();
            thread::Builder::new()
                .name(format!("sink-stderr-{node}"))
                .spawn(move || {
                    let mut text = String::new();
                    let _ = err.read_to_string(&mut text);
                    let _ = tx.send(text);
                })?;
            self.stderr = Some(rx);
        }
        debug!(node = %node, pid = child.id(), program = %self.command.program, "sink process started");
        self.child = Some(child);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let node = self.node_id();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| LoadError::sink(node, "stdin already closed"))?;
        stdin
            .write_all(bytes)
            .and_then(|()| stdin.write_all(b"\n"))
            .map_err(|e| LoadError::sink(node, format!("write to sink process failed: {e}")))
    }

    /// Whatever the process wrote to stderr, if the pipe closes within
    /// [`STDERR_DRAIN`]. The reader thread is left behind otherwise.
    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|rx| rx.recv_timeout(STDERR_DRAIN).ok())
            .unwrap_or_default()
    }

    fn complete(&mut self, success: bool) -> Result<()> {
        let node = self.node_id();
        if success && let Some(footer) = self.footer.clone() {
            self.send(footer.as_bytes())?;
        }
        if let Some(mut stdin) = self.stdin.take() {
            let flushed = stdin.flush();
            drop(stdin);
            if success {
                flushed.map_err(|e| LoadError::sink(node, format!("flush failed: {e}")))?;
            }
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if !success {
            let _ = child.kill();
            let _ = child.wait();
            self.collect_stderr();
            return Ok(());
        }
        let status = wait_with_grace(node, child, self.grace)?;
        let stderr = self.collect_stderr();
        if !status.success() {
            return Err(LoadError::sink(
                node,
                format!("sink process exited with {status}: {}", stderr.trim()),
            ));
        }
        self.exited_ok = true;
        info!(node = %node, rows = self.rows, "sink process completed");
        Ok(())
    }
}

/// Hand `child` to a monitor thread and wait at most `grace` for its exit
/// status. When the deadline passes the monitor is told to kill the child.
///
/// The monitor parks on the kill channel between `try_wait` checks, so a
/// kill request is acted on at once.
fn wait_with_grace(node: NodeId, mut child: Child, grace: Duration) -> Result<ExitStatus> {
    let (status_tx, status_rx) = mpsc::channel();
    let (kill_tx, kill_rx) = mpsc::channel::<()>();
    thread::Builder::new()
        .name(format!("sink-monitor-{node}"))
        .spawn(move || {
            let outcome = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(Some(status)),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
                match kill_rx.recv_timeout(POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break Ok(None);
                    }
                }
            };
            let _ = status_tx.send(outcome);
        })?;
    let outcome = match status_rx.recv_timeout(grace) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            let _ = kill_tx.send(());
            status_rx
                .recv()
                .map_err(|_| LoadError::sink(node, "sink monitor panicked"))?
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(LoadError::sink(node, "sink monitor panicked"));
        }
    };
    match outcome {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            warn!(node = %node, ?grace, "sink process killed after grace period");
            Err(LoadError::SinkTimeout { node, grace })
        }
        Err(e) => Err(LoadError::sink(node, format!("waiting for sink failed: {e}"))),
    }
}

/// Run the rollback command after the process already loaded its rows.
fn undo_loaded_rows(node: NodeId, rollback: Option<&RenderedCommand>) -> Result<()> {
    let Some(cmd) = rollback else {
        return Err(LoadError::sink(
            node,
            "rows already loaded and no rollback command is configured",
        ));
    };
    let out = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| LoadError::sink(node, format!("rollback command: {e}")))?;
    if !out.status.success() {
        return Err(LoadError::sink(
            node,
            format!(
                "rollback command exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ));
    }
    info!(node = %node, "rollback command completed");
    Ok(())
}

impl NodeWriter for ExternalProcessWriter {
    fn node(&self) -> NodeId {
        self.node_id()
    }

    fn state(&self) -> WriterState {
        self.lifecycle.state()
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check_start()?;
        let spawned = self.spawn();
        self.lifecycle.track(spawned)?;
        self.lifecycle.advance(WriterState::Started);
        Ok(())
    }

    fn write_row(&mut self, row: &[u8]) -> Result<()> {
        self.lifecycle.check_write()?;
        let sent = self.send(row);
        self.lifecycle.track(sent)?;
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        self.lifecycle.check_finish()?;
        let success = success && self.lifecycle.state() != WriterState::Failed;
        let done = self.complete(success);
        self.lifecycle.track(done)?;
        self.lifecycle.finished();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.lifecycle.check_commit()?;
        self.lifecycle.advance(WriterState::Committed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.lifecycle.check_rollback()?;
        let node = self.node_id();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if self.exited_ok {
            let undone = undo_loaded_rows(node, self.rollback.as_ref());
            self.lifecycle.track(undone)?;
            self.exited_ok = false;
        }
        self.lifecycle.advance(WriterState::RolledBack);
        Ok(())
    }

    fn close(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.collect_stderr();
        self.lifecycle.advance(WriterState::Closed);
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}

impl Drop for ExternalProcessWriter {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyFormat;
    use std::fs;
    use std::time::Instant;

    const N1: NodeId = NodeId::new(1);

    fn info() -> NodeConnectionInfo {
        NodeConnectionInfo {
            node: N1,
            host: "db1".into(),
            port: 6543,
            database: "sales".into(),
            user: "loader".into(),
            password: None,
        }
    }

    fn target(table: &str) -> SinkTarget {
        SinkTarget::new(table, vec!["a".into(), "b".into()], CopyFormat::text('|'))
    }

    #[test]
    fn templates_render_connection_and_format() {
        let t = CommandTemplate::new("load", ["{host}:{port}/{database}", "{table}({columns})", "-d{delimiter}"]);
        let cmd = t.render(&info().vars(&target("orders"))).unwrap();
        assert_eq!(cmd.program, "load");
        assert_eq!(cmd.args, vec!["db1:6543/sales", "orders(a, b)", "-d|"]);
    }

    #[test]
    fn unknown_placeholder_is_a_config_error() {
        let t = CommandTemplate::new("load", ["{nope}"]);
        assert!(matches!(
            t.render(&info().vars(&target("t"))),
            Err(LoadError::Config(_))
        ));
    }

    #[test]
    fn config_parses_from_json() {
        let cfg: ProcessWriterConfig = serde_json::from_str(
            r#"{ "grace_period_ms": 500,
                 "nodes": [ { "node": 1, "host": "h", "database": "d", "user": "u" } ] }"#,
        )
        .unwrap();
        assert_eq!(cfg.command.program, "psql");
        assert_eq!(cfg.nodes[0].port, 5432);
        cfg.validate().unwrap();
    }

    #[cfg(unix)]
    fn sh(script: &str) -> RenderedCommand {
        RenderedCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[cfg(unix)]
    #[test]
    fn rows_reach_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("rows.txt");
        let mut w = ExternalProcessWriter::new(N1, sh(&format!("cat > '{}'", out.display())))
            .with_footer(Some("\\.".into()));
        w.start().unwrap();
        w.write_row(b"1|a").unwrap();
        w.write_row(b"2|b").unwrap();
        w.finish(true).unwrap();
        w.commit().unwrap();
        w.close();
        assert_eq!(fs::read_to_string(&out).unwrap(), "1|a\n2|b\n\\.\n");
        assert_eq!(w.rows_written(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_reports_stderr() {
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null; echo 'bad row' >&2; exit 3"));
        w.start().unwrap();
        w.write_row(b"x").unwrap();
        let err = w.finish(true).unwrap_err();
        assert!(err.to_string().contains("bad row"), "{err}");
        assert_eq!(w.state(), WriterState::Failed);
        w.rollback().unwrap();
        w.close();
    }

    #[cfg(unix)]
    #[test]
    fn slow_process_is_killed_after_grace() {
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null; sleep 5"))
            .with_grace_period(Duration::from_millis(100));
        w.start().unwrap();
        let started = Instant::now();
        let err = w.finish(true).unwrap_err();
        assert!(matches!(err, LoadError::SinkTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(w.state(), WriterState::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn quick_exit_does_not_wait_out_the_grace_period() {
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null"))
            .with_grace_period(Duration::from_secs(20));
        w.start().unwrap();
        w.write_row(b"1|a").unwrap();
        let started = Instant::now();
        w.finish(true).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        w.commit().unwrap();
        w.close();
    }

    #[cfg(unix)]
    #[test]
    fn close_after_timeout_ignores_grandchildren_holding_stderr() {
        // `sleep` outlives the killed shell and keeps the stderr pipe open.
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null; sleep 3; true"))
            .with_grace_period(Duration::from_millis(100));
        w.start().unwrap();
        let started = Instant::now();
        assert!(matches!(w.finish(true), Err(LoadError::SinkTimeout { .. })));
        w.rollback().unwrap();
        w.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(w.state(), WriterState::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn rollback_runs_after_successful_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("rolled_back");
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null"))
            .with_rollback(Some(sh(&format!("touch '{}'", marker.display()))));
        w.start().unwrap();
        w.finish(true).unwrap();
        w.rollback().unwrap();
        assert!(marker.exists());
        assert_eq!(w.state(), WriterState::RolledBack);
    }

    #[cfg(unix)]
    #[test]
    fn rollback_without_command_fails_once_rows_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("rows.txt");
        let mut w = ExternalProcessWriter::new(N1, sh(&format!("cat > '{}'", out.display())));
        w.start().unwrap();
        w.write_row(b"1|a").unwrap();
        w.finish(true).unwrap();
        let err = w.rollback().unwrap_err();
        assert!(err.to_string().contains("no rollback command"), "{err}");
        assert_eq!(w.state(), WriterState::Failed);
        w.close();
        assert_eq!(fs::read_to_string(&out).unwrap(), "1|a\n");
    }

    #[cfg(unix)]
    #[test]
    fn rollback_before_exit_needs_no_command() {
        let mut w = ExternalProcessWriter::new(N1, sh("cat >/dev/null"));
        w.start().unwrap();
        w.write_row(b"1|a").unwrap();
        w.finish(false).unwrap();
        w.rollback().unwrap();
        assert_eq!(w.state(), WriterState::RolledBack);
        w.close();
    }
}
