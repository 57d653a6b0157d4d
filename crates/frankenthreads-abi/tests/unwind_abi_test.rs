#![cfg(all(target_os = "linux", target_env = "gnu"))]

use std::ffi::{c_int, c_void};

use frankenthreads_abi::unwind_abi::{
    UNWIND_GET_IP, frankenthreads_unwind_backtrace, frankenthreads_unwind_get_ip,
    frankenthreads_unwind_link_get, frankenthreads_unwind_symbol,
};

const URC_NO_REASON: c_int = 0;

struct Trace {
    frames: usize,
    first_ip: usize,
}

unsafe extern "C" fn count_frame(ctx: *mut c_void, arg: *mut c_void) -> c_int {
    // SAFETY: `arg` is the `Trace` passed by the test.
    let trace = unsafe { &mut *arg.cast::<Trace>() };
    if trace.frames == 0 {
        // SAFETY: `ctx` is the live unwind context for this frame.
        trace.first_ip = unsafe { frankenthreads_unwind_get_ip(ctx) };
    }
    trace.frames += 1;
    URC_NO_REASON
}

#[test]
fn unwinder_binds_and_walks_the_stack() {
    assert_eq!(frankenthreads_unwind_link_get(), 1);
    assert!(!frankenthreads_unwind_symbol(UNWIND_GET_IP as c_int).is_null());

    let mut trace = Trace {
        frames: 0,
        first_ip: 0,
    };
    // SAFETY: `count_frame` matches the trace callback ABI.
    unsafe { frankenthreads_unwind_backtrace(count_frame, std::ptr::from_mut(&mut trace).cast()) };
    assert!(trace.frames > 0);
    assert_ne!(trace.first_ip, 0);
}
