//! Accept failures from descriptor exhaustion.
//!
//! Lowers `RLIMIT_NOFILE` for the whole process, so it lives in its own test
//! binary with a single test.
//!
//! # Tests
//!
//! - `wait_for_connection` retries EMFILE and then reports
//!   `ResourceExhaustion` with every attempt counted
//! - `run` stops with the same error instead of spinning

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use npipe_core::{ChannelError, SecurityDescriptor};
use npipe_daemon::{ChannelListener, ListenerConfig};
use tempfile::TempDir;

const BUDGET: u32 = 2;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowest descriptor number not currently open.
fn lowest_free_fd() -> u64 {
    (0..)
        .find(|&fd| fcntl(fd, FcntlArg::F_GETFD) == Err(Errno::EBADF))
        .and_then(|fd| u64::try_from(fd).ok())
        .unwrap()
}

/// Restores the descriptor limit even when an assertion fails.
struct LimitGuard {
    soft: u64,
    hard: u64,
}

impl LimitGuard {
    /// Allow only the descriptors already open, so the next accept fails.
    fn exhaust() -> Self {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        setrlimit(Resource::RLIMIT_NOFILE, lowest_free_fd(), hard).unwrap();
        Self { soft, hard }
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        let _ = setrlimit(Resource::RLIMIT_NOFILE, self.soft, self.hard);
    }
}

fn assert_exhausted(err: &ChannelError) {
    match err {
        ChannelError::ResourceExhaustion { attempts, source } => {
            assert_eq!(*attempts, BUDGET + 1);
            assert_eq!(source.raw_os_error(), Some(Errno::EMFILE as i32));
        },
        other => panic!("expected ResourceExhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn descriptor_exhaustion_stops_the_listener() {
    let tmp = TempDir::new().unwrap();
    let config = ListenerConfig::new(tmp.path().join("npipe").join("emfile.sock"))
        .with_accept_retry(BUDGET, Duration::from_millis(1));
    let listener =
        ChannelListener::bind(config, Arc::new(SecurityDescriptor::owner_only())).unwrap();

    // Queued clients make accept ready; taking them needs a new descriptor.
    let _first = UnixStream::connect(listener.socket_path()).unwrap();
    let _second = UnixStream::connect(listener.socket_path()).unwrap();

    let guard = LimitGuard::exhaust();

    let instance = listener.create_instance().await.unwrap();
    let err = tokio::time::timeout(TEST_TIMEOUT, listener.wait_for_connection(instance))
        .await
        .expect("accept retries never gave up")
        .unwrap_err();
    assert_exhausted(&err);
    assert!(err.is_fatal_to_listener());

    let err = tokio::time::timeout(TEST_TIMEOUT, listener.run())
        .await
        .expect("listener kept running")
        .unwrap_err();
    assert_exhausted(&err);

    drop(guard);
}
