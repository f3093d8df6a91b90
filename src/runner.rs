//! Task runner - resolves target hosts, executes script sequences
//! sequentially or in parallel, pools SSH sessions per host, and renders
//! per-host output in declaration order

use chrono::Local;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::config::{split_upload_spec, Config, Script, Server, Task};
use crate::error::{Error, Result};
use crate::ssh::{stderr_tail, SshClient, SyncOutcome};

const DEFAULT_LOG_PATH: &str = "fleetrun.log";

/// Executes tasks from a loaded [`Config`].
///
/// Owns the per-host session pool for one task invocation; every pooled
/// connection is closed when the runner is torn down.
pub struct Runner {
    config: Config,
    clients: Mutex<HashMap<String, Arc<SshClient>>>,
    output: Mutex<Box<dyn Write + Send>>,
    log_file: Option<Mutex<File>>,
    verbose: bool,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        let log_file = if config.log.enabled {
            let path = config
                .log
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_PATH.to_string());
            match OpenOptions::new().append(true).create(true).open(&path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    log::warn!("cannot open log file {}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            output: Mutex::new(Box::new(io::stdout())),
            log_file,
            verbose: false,
        }
    }

    /// Toggle verbose output; propagated to already-pooled sessions
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        for client in self.clients.lock().unwrap().values() {
            client.set_verbose(verbose);
        }
    }

    /// Redirect rendered output, e.g. into a capture buffer for tests
    pub fn set_output(&mut self, sink: Box<dyn Write + Send>) {
        self.output = Mutex::new(sink);
    }

    /// Run one task, optionally restricted to a single server
    pub fn run(&self, task_name: &str, host_filter: Option<&str>) -> Result<()> {
        let task = self
            .config
            .tasks
            .get(task_name)
            .ok_or_else(|| Error::UnknownTask(task_name.to_string()))?
            .clone();

        let targets = self.resolve_targets(&task, host_filter);

        let parallel = task.parallel && targets.len() > 1;
        self.emit(&format!(
            "Running task: {}{}\n",
            task_name,
            if parallel { " (parallel)" } else { "" }
        ));

        let started = Instant::now();
        let result = if parallel {
            self.run_parallel(&task, &targets)
        } else {
            self.run_sequential(&task, &targets)
        };

        if self.verbose {
            self.emit(&format!("Elapsed: {}ms\n", started.elapsed().as_millis()));
        }
        result
    }

    /// Close every pooled session. Also invoked on drop.
    pub fn close(&self) {
        let mut clients = self.clients.lock().unwrap();
        for (_, client) in clients.drain() {
            client.close();
        }
    }

    /// Explicit filter > task `on` list > arbitrary single server; the
    /// result is expanded so multi-host servers become indexed siblings
    pub(crate) fn resolve_targets(&self, task: &Task, host_filter: Option<&str>) -> Vec<String> {
        let names: Vec<String> = if let Some(filter) = host_filter {
            vec![filter.to_string()]
        } else if !task.on.is_empty() {
            task.on.clone()
        } else {
            self.config.servers.keys().next().cloned().into_iter().collect()
        };
        self.config.expand_targets(&names)
    }

    /// Hosts one at a time, in declared order. The first failing step
    /// aborts the whole task; later hosts are never attempted.
    fn run_sequential(&self, task: &Task, targets: &[String]) -> Result<()> {
        let mut out = self.output.lock().unwrap();
        for name in targets {
            let server = self
                .config
                .servers
                .get(name)
                .ok_or_else(|| Error::UnknownServer(name.clone()))?;

            let banner = format!("\n[{}] {}\n", name, server.address().unwrap_or("-"));
            let _ = out.write_all(banner.as_bytes());
            self.log_line(banner.trim());

            for script in &task.scripts {
                if let Err(e) = self.run_script(name, server, script, &mut **out) {
                    let line = format!("   error: {}\n", e);
                    let _ = out.write_all(line.as_bytes());
                    self.log_line(line.trim());
                    return Err(e.on_host(name));
                }
            }
        }
        let _ = out.write_all(b"\nTask completed\n");
        let _ = out.flush();
        self.log_line("Task completed");
        Ok(())
    }

    /// One worker thread per host. Each worker writes to a private buffer
    /// and runs its full script sequence regardless of sibling failures;
    /// buffers are flushed in declared host order only after every worker
    /// has finished.
    fn run_parallel(&self, task: &Task, targets: &[String]) -> Result<()> {
        // Resolve every server up front so an unknown name aborts before
        // any worker starts
        let mut resolved: Vec<(String, Server)> = Vec::with_capacity(targets.len());
        for name in targets {
            let server = self
                .config
                .servers
                .get(name)
                .ok_or_else(|| Error::UnknownServer(name.clone()))?;
            resolved.push((name.clone(), server.clone()));
        }

        let (err_tx, err_rx) = mpsc::channel::<Error>();

        let buffers: Vec<Vec<u8>> = thread::scope(|scope| {
            let handles: Vec<_> = resolved
                .iter()
                .map(|(name, server)| {
                    let err_tx = err_tx.clone();
                    scope.spawn(move || {
                        let mut buf = Vec::new();
                        let banner =
                            format!("\n[{}] {}\n", name, server.address().unwrap_or("-"));
                        buf.extend_from_slice(banner.as_bytes());
                        self.log_line(banner.trim());

                        for script in &task.scripts {
                            if let Err(e) = self.run_script(name, server, script, &mut buf) {
                                let line = format!("   error: {}\n", e);
                                buf.extend_from_slice(line.as_bytes());
                                self.log_line(line.trim());
                                let _ = err_tx.send(e.on_host(name));
                                return buf;
                            }
                        }
                        buf.extend_from_slice(b"   done\n");
                        buf
                    })
                })
                .collect();

            // Wait for every worker; completion order does not matter here
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_default())
                .collect()
        });
        drop(err_tx);

        // Declared order, regardless of which host finished first
        for buf in &buffers {
            self.console_write(&String::from_utf8_lossy(buf));
        }

        let mut errors: Vec<Error> = err_rx.try_iter().collect();
        if !errors.is_empty() {
            self.emit(&format!("\n{} host(s) failed\n", errors.len()));
            // First error by worker completion order
            return Err(errors.remove(0));
        }

        self.emit(&format!("\nAll {} host(s) completed\n", targets.len()));
        Ok(())
    }

    fn run_script(
        &self,
        name: &str,
        server: &Server,
        script: &Script,
        out: &mut dyn Write,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.dispatch_script(name, server, script, out);
        if self.verbose {
            let _ = writeln!(out, "      took {}ms", started.elapsed().as_millis());
        }
        result
    }

    fn dispatch_script(
        &self,
        name: &str,
        server: &Server,
        script: &Script,
        out: &mut dyn Write,
    ) -> Result<()> {
        match script {
            Script::Local(cmd) => {
                self.step_line(out, "local", cmd);
                run_local(cmd, out)
            }
            Script::Run(cmd) => {
                self.step_line(out, "run", cmd);
                let client = self.client_for(name, server)?;
                client.run(cmd, out)
            }
            Script::Sync(spec) => {
                let (local, remote) = split_upload_spec(spec)?;
                self.step_line(out, "sync", &format!("{} -> {}", local, remote));
                let client = self.client_for(name, server)?;
                let local_path = Path::new(local);
                if local_path.is_dir() {
                    let stats = client.sync_dir(local_path, remote)?;
                    let _ = writeln!(
                        out,
                        "      {} uploaded, {} skipped",
                        stats.uploaded, stats.skipped
                    );
                } else {
                    match client.sync_file(local_path, remote)? {
                        SyncOutcome::Uploaded => {
                            let _ = writeln!(out, "      1 uploaded");
                        }
                        SyncOutcome::Skipped => {
                            let _ = writeln!(out, "      up to date");
                        }
                    }
                }
                Ok(())
            }
            Script::Tar(spec) => {
                let (local, remote) = split_upload_spec(spec)?;
                self.step_line(out, "tar", &format!("{} -> {}", local, remote));
                let client = self.client_for(name, server)?;
                let bytes = client.upload_archive(Path::new(local), remote)?;
                if self.verbose {
                    let _ = writeln!(out, "      {} bytes archived", bytes);
                }
                Ok(())
            }
            Script::Scp(spec) => {
                let (local, remote) = split_upload_spec(spec)?;
                self.step_line(out, "scp", &format!("{} -> {}", local, remote));
                let client = self.client_for(name, server)?;
                let files = client.copy(Path::new(local), remote)?;
                if self.verbose {
                    let _ = writeln!(out, "      {} file(s) sent", files);
                }
                Ok(())
            }
        }
    }

    /// Pooled session lookup: at most one connection per expanded host,
    /// created lazily under the lock
    fn client_for(&self, name: &str, server: &Server) -> Result<Arc<SshClient>> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }

        let host = server
            .address()
            .ok_or_else(|| Error::NoHost(name.to_string()))?;
        let client = SshClient::connect(host, &server.user, &server.key, server.port)?;
        client.set_verbose(self.verbose);
        let client = Arc::new(client);
        clients.insert(name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    fn step_line(&self, out: &mut dyn Write, label: &str, detail: &str) {
        let line = format!("   {}: {}\n", label, truncate(detail, 60));
        let _ = out.write_all(line.as_bytes());
        self.log_line(&format!("{}: {}", label, detail));
    }

    /// Console and log file
    fn emit(&self, msg: &str) {
        self.console_write(msg);
        self.log_line(msg);
    }

    /// Console only
    fn console_write(&self, msg: &str) {
        let mut out = self.output.lock().unwrap();
        let _ = out.write_all(msg.as_bytes());
        let _ = out.flush();
    }

    /// Log file only, one timestamped line
    fn log_line(&self, msg: &str) {
        if let Some(file) = &self.log_file {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let mut file = file.lock().unwrap();
            let _ = writeln!(file, "[{}] {}", stamp, msg.trim());
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a command through the local shell, streaming stdout into the sink
/// and draining stderr alongside
fn run_local(command: &str, out: &mut dyn Write) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain stderr on a side thread so neither pipe can fill and stall
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    if let Some(mut stdout_pipe) = child.stdout.take() {
        io::copy(&mut stdout_pipe, out)?;
    }

    let status = child.wait()?;
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if !stderr.is_empty() {
        out.write_all(&stderr)?;
    }

    if !status.success() {
        return Err(Error::LocalExec {
            status: status.code().unwrap_or(-1),
            stderr: stderr_tail(&String::from_utf8_lossy(&stderr)),
        });
    }
    Ok(())
}

/// Single-line, bounded rendition of a command for step banners
fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}
