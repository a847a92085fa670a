#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sandrun::docker::{
    encode_frame, AttachSpec, ContainerInfo, ContainerOption, ContainerOptions, ContainerSpec,
    EngineClient, ExecSpec, ExecStatus, HijackedConnection, StdStream, Terminal, TerminalSize,
};
use sandrun::{HarnessConfig, HarnessError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct ExecRecord {
    spec: ExecSpec,
    running: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i64>>>,
}

/// In-memory engine. Exec commands are interpreted by name:
///
/// - `/bin/sh -c CMD` runs CMD split into words
/// - `echo ARGS..` prints ARGS to stdout
/// - `exit CODE` exits with CODE
/// - `fail CODE MSG..` prints MSG to stderr and exits with CODE
/// - `cat` echoes stdin to stdout until stdin closes
/// - `env` prints the exec environment, `pwd` its working directory
/// - `late ARGS..` waits a moment, then prints ARGS to stdout
/// - `hang` never finishes
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    pub images: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    execs: Mutex<HashMap<String, ExecRecord>>,
    next_id: AtomicUsize,
    pub fail_create_container: AtomicBool,
    pub fail_start_exec: AtomicBool,
    pub fail_kill: AtomicBool,
    /// Exec output written after the client side of the connection went away.
    pub lost_writes: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let engine = Self::default();
        engine.images.lock().push("ubuntu".to_string());
        Arc::new(engine)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    pub fn exec_spec(&self, exec_id: &str) -> Option<ExecSpec> {
        self.execs.lock().get(exec_id).map(|r| r.spec.clone())
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn fake_error(op: &'static str, target: &str) -> HarnessError {
    HarnessError::engine(op, target, "injected failure")
}

async fn send(
    server: &mut WriteHalf<DuplexStream>,
    tty: bool,
    stream: StdStream,
    data: &[u8],
) -> bool {
    if data.is_empty() {
        return true;
    }
    let bytes = if tty {
        data.to_vec()
    } else {
        encode_frame(stream, data).to_vec()
    };
    server.write_all(&bytes).await.is_ok()
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn has_image(&self, image: &str) -> Result<bool> {
        self.record(format!("has_image {image}"));
        Ok(self.images.lock().iter().any(|i| i == image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(format!("pull_image {image}"));
        self.images.lock().push(image.to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self.images.lock().clone())
    }

    async fn remove_image(&self, image: &str, _force: bool) -> Result<()> {
        self.record(format!("remove_image {image}"));
        self.images.lock().retain(|i| i != image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create_container".to_string());
        if self.fail_create_container.load(Ordering::SeqCst) {
            return Err(fake_error("create_container", &spec.image));
        }
        self.created.lock().push(spec.clone());
        Ok(self.next("container"))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start_container {id}"));
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        self.record(format!("kill_container {id} {signal}"));
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(fake_error("kill_container", id));
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        self.record(format!("remove_container {id}"));
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.record(format!("inspect_container {id}"));
        Ok(ContainerInfo {
            id: id.to_string(),
            status: "running".to_string(),
            running: true,
            exit_code: None,
        })
    }

    async fn attach_container(
        &self,
        id: &str,
        _attach: AttachSpec,
        tty: bool,
    ) -> Result<HijackedConnection> {
        self.record(format!("attach_container {id}"));
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (_, mut writer) = tokio::io::split(server);
            send(&mut writer, tty, StdStream::Stdout, b"booted\n").await;
        });
        let (output, input) = tokio::io::split(client);
        Ok(HijackedConnection {
            output: Box::new(output),
            input: Box::new(input),
        })
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        self.record(format!("create_exec {container_id} {}", spec.cmd.join(" ")));
        let id = self.next("exec");
        self.execs.lock().insert(
            id.clone(),
            ExecRecord {
                spec: spec.clone(),
                running: Arc::new(AtomicBool::new(false)),
                exit_code: Arc::new(Mutex::new(None)),
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedConnection> {
        self.record(format!("start_exec {exec_id}"));
        if self.fail_start_exec.load(Ordering::SeqCst) {
            return Err(fake_error("start_exec", exec_id));
        }

        let (spec, running, exit_code) = {
            let execs = self.execs.lock();
            let record = execs
                .get(exec_id)
                .ok_or_else(|| fake_error("start_exec", exec_id))?;
            (
                record.spec.clone(),
                record.running.clone(),
                record.exit_code.clone(),
            )
        };
        running.store(true, Ordering::SeqCst);
        let lost_writes = self.lost_writes.clone();

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let mut argv = spec.cmd.clone();
            if matches!(argv.first().map(String::as_str), Some("/bin/sh" | "sh"))
                && argv.get(1).map(String::as_str) == Some("-c")
            {
                argv = argv.get(2).and_then(|c| shlex::split(c)).unwrap_or_default();
            }
            let program = argv.first().cloned().unwrap_or_default();
            let args = argv.get(1..).unwrap_or_default();
            let mut code = 0;
            match program.as_str() {
                "echo" => {
                    let line = format!("{}\n", args.join(" "));
                    send(&mut writer, tty, StdStream::Stdout, line.as_bytes()).await;
                }
                "exit" => {
                    code = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
                }
                "fail" => {
                    code = args.first().and_then(|c| c.parse().ok()).unwrap_or(1);
                    let line = format!("{}\n", args.get(1..).unwrap_or_default().join(" "));
                    send(&mut writer, tty, StdStream::Stderr, line.as_bytes()).await;
                }
                "cat" => {
                    let mut input = Vec::new();
                    let _ = reader.read_to_end(&mut input).await;
                    send(&mut writer, tty, StdStream::Stdout, &input).await;
                }
                "env" => {
                    let listing = format!("{}\n", spec.env.join("\n"));
                    send(&mut writer, tty, StdStream::Stdout, listing.as_bytes()).await;
                }
                "pwd" => {
                    let dir = format!("{}\n", spec.working_dir.clone().unwrap_or_default());
                    send(&mut writer, tty, StdStream::Stdout, dir.as_bytes()).await;
                }
                "late" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let line = format!("{}\n", args.join(" "));
                    if !send(&mut writer, tty, StdStream::Stdout, line.as_bytes()).await {
                        lost_writes.fetch_add(1, Ordering::SeqCst);
                    }
                }
                "hang" => {
                    std::future::pending::<()>().await;
                }
                other => {
                    code = 127;
                    let line = format!("{other}: not found\n");
                    send(&mut writer, tty, StdStream::Stderr, line.as_bytes()).await;
                }
            }
            *exit_code.lock() = Some(code);
            running.store(false, Ordering::SeqCst);
        });

        let (output, input) = tokio::io::split(client);
        Ok(HijackedConnection {
            output: Box::new(output),
            input: Box::new(input),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        self.record(format!("inspect_exec {exec_id}"));
        let execs = self.execs.lock();
        let record = execs
            .get(exec_id)
            .ok_or_else(|| fake_error("inspect_exec", exec_id))?;
        let exit_code = *record.exit_code.lock();
        let status = ExecStatus {
            running: record.running.load(Ordering::SeqCst),
            exit_code,
        };
        Ok(status)
    }

    async fn resize_container(&self, id: &str, height: u16, width: u16) -> Result<()> {
        self.record(format!("resize_container {id} {height}x{width}"));
        Ok(())
    }

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        self.record(format!("resize_exec {exec_id} {height}x{width}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

pub struct FakeTerminal {
    pub terminal: bool,
    pub raw_calls: AtomicUsize,
    pub restore_calls: AtomicUsize,
    pub size: Mutex<Option<TerminalSize>>,
}

impl FakeTerminal {
    pub fn new(terminal: bool) -> Arc<Self> {
        Arc::new(Self {
            terminal,
            raw_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            size: Mutex::new(Some(TerminalSize {
                height: 24,
                width: 80,
            })),
        })
    }

    pub fn resize(&self, height: u16, width: u16) {
        *self.size.lock() = Some(TerminalSize { height, width });
    }
}

impl Terminal for FakeTerminal {
    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn set_raw(&self) -> Result<()> {
        self.raw_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn size(&self) -> Option<TerminalSize> {
        *self.size.lock()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Options with a fake terminal and no TTY, so output arrives framed.
pub fn options(terminal: Arc<FakeTerminal>) -> ContainerOptions {
    ContainerOptions::new(&HarnessConfig::default())
        .unwrap()
        .with(ContainerOption::Terminal(terminal))
        .with(ContainerOption::Tty(false))
}

pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
