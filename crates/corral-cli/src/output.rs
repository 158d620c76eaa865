//! Human-readable formatting for CLI output.

use std::time::Duration;

use corral_common::types::ContainerState;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats cumulative CPU time, e.g. `1.25s`.
#[must_use]
pub fn format_cpu(nanos: u64) -> String {
    format!("{:.2}s", Duration::from_nanos(nanos).as_secs_f64())
}

/// Colored marker for a container state.
#[must_use]
pub const fn state_marker(state: ContainerState) -> &'static str {
    match state {
        ContainerState::Running => "\x1b[32m●\x1b[0m",
        ContainerState::Exited | ContainerState::Stopped => "\x1b[2m○\x1b[0m",
        _ => "\x1b[33m◐\x1b[0m",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_in_seconds() {
        assert_eq!(format_cpu(1_250_000_000), "1.25s");
        assert_eq!(format_cpu(0), "0.00s");
    }

    #[test]
    fn terminal_states_share_a_marker() {
        assert_eq!(
            state_marker(ContainerState::Exited),
            state_marker(ContainerState::Stopped)
        );
        assert_ne!(
            state_marker(ContainerState::Running),
            state_marker(ContainerState::Starting)
        );
    }

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }

    #[test]
    fn format_bytes_displays_gib() {
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }
}
