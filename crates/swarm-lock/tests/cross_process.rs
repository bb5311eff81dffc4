//! Mutual exclusion across forked processes sharing one mapping.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::sync::atomic::{AtomicU64, Ordering};
use swarm_lock::{LockHandle, Shared, SharedCounter};

const CHILDREN: usize = 4;
const ROUNDS: u64 = 20_000;

#[test]
fn test_lock_excludes_across_fork() {
    let lock = LockHandle::create().unwrap();
    let value = Shared::<AtomicU64>::new().unwrap();
    let tally = SharedCounter::create().unwrap();

    let mut pids = Vec::new();
    for i in 0..CHILDREN {
        // Safety: the child only touches shared atomics and then _exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let mut code = 0;
                for _ in 0..ROUNDS {
                    let acquired = if i % 2 == 0 {
                        lock.acquire()
                    } else {
                        lock.acquire_relaxed()
                    };
                    if acquired.is_err() {
                        code = 1;
                        break;
                    }
                    let v = value.load(Ordering::Relaxed);
                    value.store(v + 1, Ordering::Relaxed);
                    if lock.release().is_err() {
                        code = 2;
                        break;
                    }
                }
                if tally.increment().is_err() {
                    code = 3;
                }
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => pids.push(child),
        }
    }

    for pid in pids {
        let status = waitpid(pid, None).unwrap();
        assert_eq!(status, WaitStatus::Exited(pid, 0));
    }

    assert_eq!(value.load(Ordering::Relaxed), CHILDREN as u64 * ROUNDS);
    assert_eq!(tally.get(), CHILDREN as u64);
    lock.destroy().unwrap();
}
