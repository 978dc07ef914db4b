//! SIGSEGV trap installation and chaining.
//!
//! Only protection faults (`SEGV_ACCERR`) on tracked addresses are consumed;
//! everything else chains to whatever handler was installed before us, and a
//! genuine crash still crashes. Install/uninstall is refcounted so the
//! in-process multi-rank harnesses share one trap.

use std::io;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

/// `libc` on this target doesn't expose `SEGV_ACCERR`; the si_code value is
/// standardized by the kernel ABI (Linux/glibc: access to a mapped page that
/// violated its protection bits).
const SEGV_ACCERR: c_int = 2;

static INSTALLS: Mutex<u32> = Mutex::new(0);
/// The handler that was active before ours; read from signal context, so it
/// is published through an atomic pointer and intentionally leaked.
static OLD_ACTION: AtomicPtr<libc::sigaction> = AtomicPtr::new(ptr::null_mut());

/// Installs the trap on first call; later calls only bump the refcount.
pub(crate) fn install() -> io::Result<()> {
    let mut installs = INSTALLS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *installs == 0 {
        // SAFETY: plain sigaction setup; the handler only touches
        // async-signal-tolerant state (see on_segv).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_sigaction = on_segv as usize;
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
                return Err(io::Error::last_os_error());
            }
            OLD_ACTION.store(Box::into_raw(Box::new(previous)), Ordering::Release);
        }
    }
    *installs += 1;
    Ok(())
}

/// Restores the previous handler once the last user is gone.
pub(crate) fn uninstall() {
    let mut installs = INSTALLS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *installs == 0 {
        return;
    }
    *installs -= 1;
    if *installs == 0 {
        let previous = OLD_ACTION.swap(ptr::null_mut(), Ordering::AcqRel);
        if !previous.is_null() {
            // SAFETY: restoring the sigaction captured at install time. The
            // box is leaked: a fault racing the teardown may still chain
            // through it.
            unsafe { libc::sigaction(libc::SIGSEGV, &*previous, ptr::null_mut()) };
        }
    }
}

extern "C" fn on_segv(sig: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    // SAFETY: the kernel hands us a valid siginfo for SA_SIGINFO handlers.
    let (addr, code) = unsafe { ((*info).si_addr() as usize, (*info).si_code) };
    if code == SEGV_ACCERR && crate::runtime::dispatch_fault(addr) {
        return;
    }
    chain(sig, info, context);
}

/// Forwards an unconsumed fault to the previously installed handler.
fn chain(sig: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let previous = OLD_ACTION.load(Ordering::Acquire);
    if previous.is_null() {
        reset_to_default(sig);
        return;
    }
    // SAFETY: published once at install time, never freed.
    let previous = unsafe { &*previous };
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: SA_SIGINFO guarantees this calling convention.
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(sig, info, context);
        return;
    }
    match previous.sa_sigaction {
        libc::SIG_DFL => reset_to_default(sig),
        libc::SIG_IGN => {}
        handler => {
            // SAFETY: a plain signal handler takes only the signal number.
            let handler: extern "C" fn(c_int) = unsafe { std::mem::transmute(handler) };
            handler(sig);
        }
    }
}

/// Reinstalls the default disposition and returns; the kernel re-raises the
/// fault when the access retries, producing the normal crash.
fn reset_to_default(sig: c_int) {
    // SAFETY: installing SIG_DFL is always valid.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, ptr::null_mut());
    }
}
