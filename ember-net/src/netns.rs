//! Running code inside a named network namespace.
//!
//! `setns(2)` changes the namespace of the calling kernel thread only. Doing
//! that on a runtime worker would leak the sandbox namespace to whatever task
//! the worker polls next, so the switch happens on a dedicated OS thread that
//! nothing else runs on. A guard restores the original namespace before the
//! thread returns, including when the closure panics.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};

/// Where `ip netns add` bind-mounts named namespaces.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Path of the handle for `namespace`.
#[must_use]
pub fn namespace_path(namespace: &str) -> PathBuf {
    Path::new(NETNS_RUN_DIR).join(namespace)
}

/// Holds the thread's original namespace and switches back on drop.
struct NamespaceGuard {
    original: File,
}

impl NamespaceGuard {
    fn enter(target: &Path) -> io::Result<Self> {
        let original = File::open("/proc/thread-self/ns/net")?;
        let handle = File::open(target)?;
        setns(&handle, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)?;
        Ok(Self { original })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            // The thread exits right after; it is never reused.
            tracing::error!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Run `f` on a dedicated thread switched into `namespace`.
///
/// # Errors
/// Returns the error from entering the namespace, from `f`, or an error if
/// the worker thread could not be spawned or panicked.
pub async fn run_in_namespace<F, T>(namespace: &str, f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let target = namespace_path(namespace);
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name(format!("netns-{namespace}"))
        .spawn(move || {
            let result = NamespaceGuard::enter(&target).and_then(|guard| {
                let out = f();
                drop(guard);
                out
            });
            let _ = tx.send(result);
        })?;

    rx.await
        .map_err(|_| io::Error::other("namespace worker thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_netns() -> io::Result<PathBuf> {
        std::fs::read_link("/proc/thread-self/ns/net")
    }

    #[tokio::test]
    async fn missing_namespace_is_not_found() {
        let result = run_in_namespace("ember-test-does-not-exist", || Ok(())).await;
        match result {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            Ok(()) => panic!("entering a missing namespace must fail"),
        }
    }

    #[tokio::test]
    #[ignore = "requires root and iproute2"]
    async fn switch_is_confined_to_the_worker_thread() {
        let ns = "ember-test-netns";
        let created = std::process::Command::new("ip").args(["netns", "add", ns]).status();
        assert!(matches!(created, Ok(s) if s.success()), "ip netns add failed");

        let before = current_netns().ok();
        let inside = run_in_namespace(ns, current_netns).await;
        let after = current_netns().ok();
        let _ = std::process::Command::new("ip").args(["netns", "del", ns]).status();

        let inside = match inside {
            Ok(p) => p,
            Err(e) => panic!("run_in_namespace failed: {e}"),
        };
        assert_ne!(Some(inside), before, "closure must observe the target namespace");
        assert_eq!(before, after, "caller namespace must be unchanged");
    }
}
