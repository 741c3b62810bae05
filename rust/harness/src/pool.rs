//! Bounded pool of local worker processes.
//!
//! At most `capacity` workers run at once. Admission happens on the dispatch
//! loop: when every slot is taken, [`WorkerPool::admit`] blocks until a worker
//! reports completion. Each worker posts its own id on the completion channel
//! as its last action, and that message is the only thing that frees a slot.

use std::{
    collections::VecDeque,
    fmt,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

/// Lines of stderr kept for the failure report.
const STDERR_TAIL: usize = 20;

/// Identifier of an admitted worker, unique for the life of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Message a worker posts when it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: WorkerId,
}

/// Posts a [`Completion`] exactly once: explicitly, or when dropped.
#[derive(Debug)]
pub struct CompletionSignal {
    id: WorkerId,
    tx: Option<mpsc::UnboundedSender<Completion>>,
}

impl CompletionSignal {
    fn new(id: WorkerId, tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self { id, tx: Some(tx) }
    }

    /// Report completion now.
    pub fn post(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if let Some(tx) = self.tx.take()
            && tx.send(Completion { id: self.id }).is_err()
        {
            tracing::debug!("Pool gone before {} completed", self.id);
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.send();
    }
}

/// One unit of local work: run `commands` in order inside `dir`.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub name: String,
    pub dir: PathBuf,
    pub commands: Vec<String>,
}

impl WorkerTask {
    fn spawn(&self) -> std::io::Result<Child> {
        let script = self.commands.join("\n");
        tracing::debug!("Spawning {} in {}:\n{script}", self.name, self.dir.display());
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// Admission-controlled worker pool.
///
/// Owned by the dispatch loop; every mutation goes through `&mut self`.
#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    occupied: usize,
    active: Vec<WorkerId>,
    next_id: u64,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` workers.
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(PoolError::ZeroCapacity)?;
        Ok(Self::with_capacity(capacity))
    }

    /// Create a pool sized to the host's available parallelism.
    #[must_use]
    pub fn with_host_cores() -> Self {
        let cores = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
        Self::with_capacity(cores)
    }

    fn with_capacity(capacity: NonZeroUsize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!("Worker pool with {capacity} slots");
        Self {
            capacity: capacity.get(),
            occupied: 0,
            active: Vec::new(),
            next_id: 0,
            tx,
            rx,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held by workers.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Active workers in admission order.
    #[must_use]
    pub fn active(&self) -> &[WorkerId] {
        &self.active
    }

    /// Admit a task, waiting for a free slot first if the pool is full.
    ///
    /// The slot is taken only once the process is running. A spawn failure
    /// leaves the pool unchanged.
    pub async fn admit(&mut self, task: WorkerTask) -> Result<WorkerId, PoolError> {
        if self.occupied >= self.capacity {
            tracing::debug!(
                "All {} slots taken, waiting before {}",
                self.capacity,
                task.name
            );
            self.reclaim().await?;
        }

        let child = task.spawn().map_err(|source| PoolError::Spawn {
            name: task.name.clone(),
            source,
        })?;

        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.occupied += 1;
        self.active.push(id);
        tracing::info!(
            "Started {} as {id} ({}/{} slots)",
            task.name,
            self.occupied,
            self.capacity
        );

        let signal = CompletionSignal::new(id, self.tx.clone());
        tokio::spawn(supervise(task, child, signal));
        Ok(id)
    }

    /// Wait for one completion and release its slot.
    async fn reclaim(&mut self) -> Result<WorkerId, PoolError> {
        let Completion { id } = self.rx.recv().await.ok_or(PoolError::ChannelClosed)?;
        let pos = self
            .active
            .iter()
            .position(|&active| active == id)
            .ok_or(PoolError::ProtocolViolation(id))?;
        self.active.remove(pos);
        self.occupied -= 1;
        tracing::debug!("Reclaimed slot from {id}");
        Ok(id)
    }

    /// Wait for every active worker to finish.
    pub async fn drain(&mut self) -> Result<(), PoolError> {
        if self.occupied > 0 {
            tracing::info!("Waiting for {} workers", self.occupied);
        }
        while self.occupied > 0 {
            self.reclaim().await?;
        }
        Ok(())
    }
}

/// Stream a worker's output to its log files, report the outcome, then signal.
async fn supervise(task: WorkerTask, mut child: Child, signal: CompletionSignal) {
    let header = format!(
        "--- {} started at {} ---\n",
        task.name,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let stdout_task = child.stdout.take().map(|out| {
        let path = task.dir.join("stdout.log");
        let header = header.clone();
        tokio::spawn(async move { stream_lines(out, &path, &header, 0).await })
    });
    let stderr_task = child.stderr.take().map(|err| {
        let path = task.dir.join("stderr.log");
        tokio::spawn(async move { stream_lines(err, &path, &header, STDERR_TAIL).await })
    });

    let status = child.wait().await;

    if let Some(handle) = stdout_task {
        let _ = handle.await;
    }
    let tail = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };

    match status {
        Ok(status) if status.success() => tracing::info!("{} finished", task.name),
        Ok(status) => tracing::error!(
            "{} failed with exit code {:?}:\n{}",
            task.name,
            status.code(),
            tail.join("\n")
        ),
        Err(e) => tracing::error!("{} process error: {e}", task.name),
    }

    signal.post();
}

/// Copy output from `reader` into `path` byte for byte, returning the last
/// `keep` lines.
///
/// The pipe is always read to EOF, so the worker never sees it close early.
async fn stream_lines(
    reader: impl AsyncRead + Unpin,
    path: &Path,
    header: &str,
    keep: usize,
) -> Vec<String> {
    let mut file = match File::create(path).await {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!("Cannot write {}: {e}", path.display());
            None
        }
    };
    if let Some(ref mut f) = file {
        let _ = f.write_all(header.as_bytes()).await;
    }

    let mut tail = VecDeque::with_capacity(keep);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Reading output for {} failed: {e}", path.display());
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    tracing::warn!("Discarding output for {} failed: {e}", path.display());
                }
                break;
            }
        }
        if let Some(ref mut f) = file {
            let _ = f.write_all(&buf).await;
        }
        if keep > 0 {
            if tail.len() >= keep {
                tail.pop_front();
            }
            let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
            tail.push_back(String::from_utf8_lossy(line).into_owned());
        }
    }
    if let Some(ref mut f) = file {
        let _ = f.flush().await;
    }
    tail.into_iter().collect()
}

/// Errors that can occur in the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool capacity must be at least 1")]
    ZeroCapacity,
    #[error("failed to spawn worker for {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("completion from unknown worker {0}")]
    ProtocolViolation(WorkerId),
    #[error("completion channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use super::*;

    fn task(name: &str, dir: &Path, commands: &[&str]) -> WorkerTask {
        WorkerTask {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            commands: commands.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(PoolError::ZeroCapacity)));
        assert!(WorkerPool::with_host_cores().capacity() >= 1);
    }

    #[tokio::test]
    async fn test_admission_blocks_when_full() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(2).unwrap();
        let start = Instant::now();

        for i in 0..2 {
            pool.admit(task(&format!("job{i}"), dir.path(), &["sleep 0.5"]))
                .await
                .unwrap();
            assert!(pool.active().len() <= 2);
        }
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(pool.occupied(), 2);

        pool.admit(task("job2", dir.path(), &["sleep 0.5"]))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(pool.occupied(), 2);
        assert_eq!(pool.active().len(), 2);

        pool.drain().await.unwrap();
        assert_eq!(pool.occupied(), 0);
        assert!(pool.active().is_empty());
    }

    #[tokio::test]
    async fn test_single_slot_serializes_work() {
        let dir = tempdir().unwrap();
        let trace = dir.path().join("trace");
        let mut pool = WorkerPool::new(1).unwrap();

        for i in 0..3 {
            let record = format!(
                "echo start{i} >> {t}; sleep 0.1; echo end{i} >> {t}",
                t = trace.display()
            );
            pool.admit(task(&format!("job{i}"), dir.path(), &[&record]))
                .await
                .unwrap();
            assert_eq!(pool.occupied(), 1);
        }
        pool.drain().await.unwrap();

        let lines: Vec<String> = std::fs::read_to_string(&trace)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(
            lines,
            ["start0", "end0", "start1", "end1", "start2", "end2"]
        );
    }

    #[tokio::test]
    async fn test_worker_logs_and_runs_in_dir() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(1).unwrap();
        pool.admit(task(
            "job0",
            dir.path(),
            &["echo hello", "echo oops >&2", "touch marker"],
        ))
        .await
        .unwrap();
        pool.drain().await.unwrap();

        assert!(dir.path().join("marker").exists());
        let stdout = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        assert!(stdout.starts_with("--- job0 started at "));
        assert!(stdout.ends_with("hello\n"));
        let stderr = std::fs::read_to_string(dir.path().join("stderr.log")).unwrap();
        assert!(stderr.ends_with("oops\n"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_does_not_stop_worker() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(1).unwrap();
        pool.admit(task(
            "binary",
            dir.path(),
            &[
                r"printf 'ok\n\377\n'",
                "sleep 0.3",
                "i=0; while [ $i -lt 5000 ]; do echo line$i; i=$((i+1)); done",
                "touch finished",
            ],
        ))
        .await
        .unwrap();
        pool.drain().await.unwrap();

        assert!(dir.path().join("finished").exists());
        let stdout = std::fs::read(dir.path().join("stdout.log")).unwrap();
        assert!(stdout.windows(4).any(|w| w == b"ok\n\xff"));
        assert!(stdout.ends_with(b"line4999\n"));
    }

    #[tokio::test]
    async fn test_stream_lines_keeps_raw_bytes_and_lossy_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stderr.log");
        let input: &[u8] = b"first\n\xffbad\nlast";

        let tail = stream_lines(input, &path, "--- header ---\n", 2).await;
        assert_eq!(tail, ["\u{fffd}bad", "last"]);
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"--- header ---\nfirst\n\xffbad\nlast"
        );
    }

    #[tokio::test]
    async fn test_failing_worker_still_frees_slot() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(1).unwrap();
        pool.admit(task("bad", dir.path(), &["exit 7"])).await.unwrap();
        pool.admit(task("good", dir.path(), &["true"])).await.unwrap();
        pool.drain().await.unwrap();
        assert_eq!(pool.occupied(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_pool_unchanged() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(2).unwrap();
        let err = pool
            .admit(task("lost", &dir.path().join("missing"), &["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn { ref name, .. } if name == "lost"));
        assert_eq!(pool.occupied(), 0);
        assert!(pool.active().is_empty());

        let id = pool.admit(task("next", dir.path(), &["true"])).await.unwrap();
        assert_eq!(id.to_string(), "w0");
        pool.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_completion_is_protocol_violation() {
        let dir = tempdir().unwrap();
        let mut pool = WorkerPool::new(1).unwrap();
        pool.admit(task("job0", dir.path(), &["sleep 0.2"]))
            .await
            .unwrap();
        pool.tx.send(Completion { id: WorkerId(99) }).unwrap();

        let err = pool
            .admit(task("job1", dir.path(), &["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ProtocolViolation(WorkerId(99))));
    }

    #[tokio::test]
    async fn test_signal_posts_once_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(CompletionSignal::new(WorkerId(3), tx.clone()));
        assert_eq!(rx.recv().await, Some(Completion { id: WorkerId(3) }));

        CompletionSignal::new(WorkerId(4), tx).post();
        assert_eq!(rx.recv().await, Some(Completion { id: WorkerId(4) }));
        assert!(rx.try_recv().is_err());
    }
}
