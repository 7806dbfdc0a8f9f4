//! Runtime introspection probe
//!
//! Reports whether a tracer (debugger, ptrace-based instrumentation) is
//! attached to this process. On Linux this reads `TracerPid` from
//! `/proc/self/status`; elsewhere the probe always reports no tracer.

/// Pid of the attached tracer, if any
pub fn tracer_pid() -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_tracer_pid(&status))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
}
