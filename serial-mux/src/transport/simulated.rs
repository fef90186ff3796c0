use async_trait::async_trait;
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::{sync::RwLock, task};

use super::{PeerIdentity, TransportBackend};
use crate::error::Result;

/// Channel file written by A and read by B.
pub const A_TO_B_FILE: &str = "a_to_b.txt";

/// Channel file written by B and read by A.
pub const B_TO_A_FILE: &str = "b_to_a.txt";

/// Longest a single operation waits for the other peer to release a
/// channel file.
pub const LOCK_WAIT: Duration = Duration::from_millis(50);

const LOCK_RETRY: Duration = Duration::from_millis(1);

/// Backend emulating a serial link with two text files.
///
/// Each file is a unidirectional channel holding one message per line;
/// peer A's write channel is peer B's read channel and vice versa. Appends
/// and destructive reads take an exclusive `flock(2)` on the channel file,
/// so two processes sharing the directory never see torn or lost lines.
///
/// A channel the other side keeps locked for longer than [`LOCK_WAIT`]
/// counts as busy: the write fails with `WouldBlock` and the read returns
/// nothing. File work runs on the blocking pool; `close` waits for any of
/// it still in flight and refuses new work afterwards, so nothing touches
/// the files once `close` has returned.
#[derive(Debug)]
pub struct SimulatedFileBackend {
    peer: PeerIdentity,
    write_path: PathBuf,
    read_path: PathBuf,
    // Read-held by every file operation, write-held by close; true once closed
    closed: Arc<RwLock<bool>>,
}

impl SimulatedFileBackend {
    /// Set up the channel files for `peer` in `dir`, creating any that are
    /// missing. Existing contents are left in place.
    pub fn new(peer: PeerIdentity, dir: &Path) -> Result<Self> {
        let (write_name, read_name) = match peer {
            PeerIdentity::A => (A_TO_B_FILE, B_TO_A_FILE),
            PeerIdentity::B => (B_TO_A_FILE, A_TO_B_FILE),
        };

        fs::create_dir_all(dir)?;
        let backend = Self {
            peer,
            write_path: dir.join(write_name),
            read_path: dir.join(read_name),
            closed: Arc::new(RwLock::new(false)),
        };
        for path in [&backend.write_path, &backend.read_path] {
            OpenOptions::new().append(true).create(true).open(path)?;
        }
        Ok(backend)
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub fn write_path(&self) -> &Path {
        &self.write_path
    }

    pub fn read_path(&self) -> &Path {
        &self.read_path
    }

    // Run `op` on the blocking pool, holding the gate until it finishes even
    // if the calling task is aborted meanwhile.
    async fn run_blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let gate = self.closed.clone().read_owned().await;
        if *gate {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated link closed",
            ));
        }
        task::spawn_blocking(move || {
            let result = op();
            drop(gate);
            result
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[async_trait]
impl TransportBackend for SimulatedFileBackend {
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let path = self.write_path.clone();
        let bytes = bytes.to_vec();
        self.run_blocking(move || append(&path, &bytes)).await
    }

    async fn read_line(&self) -> io::Result<Vec<u8>> {
        let path = self.read_path.clone();
        self.run_blocking(move || pop_line(&path)).await
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        *self.closed.write().await = true;
        Ok(())
    }
}

// Take an exclusive lock, retrying for at most LOCK_WAIT. None means the
// file stayed locked elsewhere.
fn try_lock_exclusive(mut file: File) -> io::Result<Option<Flock<File>>> {
    let deadline = Instant::now() + LOCK_WAIT;
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(Some(locked)),
            Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                file = returned;
                thread::sleep(LOCK_RETRY);
            }
            Err((_, errno)) => return Err(errno.into()),
        }
    }
}

fn append(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let Some(mut file) = try_lock_exclusive(file)? else {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("{} is locked by another process", path.display()),
        ));
    };
    file.write_all(bytes)
}

// Remove and return the first complete line. A trailing fragment without
// a newline belongs to a write still in progress elsewhere and stays put.
fn pop_line(path: &Path) -> io::Result<Vec<u8>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let Some(mut file) = try_lock_exclusive(file)? else {
        return Ok(Vec::new());
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let Some(end) = contents.iter().position(|b| *b == b'\n') else {
        return Ok(Vec::new());
    };

    let rest = &contents[end + 1..];
    file.seek(SeekFrom::Start(0))?;
    file.write_all(rest)?;
    file.set_len(rest.len() as u64)?;

    let mut line = contents;
    line.truncate(end);
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}
