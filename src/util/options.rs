//! Collector pacing options, overridable from the environment.

/// Tunable knobs read once at state creation. Every field can be
/// overridden with a `LUNA_GC_*` environment variable (`LUNA_GC_PAUSE`,
/// `LUNA_GC_STEPMUL`, `LUNA_GC_MINOR`, `LUNA_GC_STRTAB`).
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Post-cycle threshold as a percentage of the live estimate.
    pub pause: usize,
    /// Per-step work multiplier (percent).
    pub stepmul: usize,
    /// Minor mode: mark bits survive sweep, no black flip.
    pub minor: bool,
    /// Initial primary string-table size (rounded up to a power of two).
    pub strtab_size: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            pause: 200,
            stepmul: 200,
            minor: false,
            strtab_size: crate::util::constants::MIN_STRTAB,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let v = std::env::var(name).ok()?;
    match v.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("ignoring unparsable {}={:?}", name, v);
            None
        }
    }
}

impl GcOptions {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut opts = GcOptions::default();
        if let Some(n) = env_usize("LUNA_GC_PAUSE") {
            opts.pause = n;
        }
        if let Some(n) = env_usize("LUNA_GC_STEPMUL") {
            opts.stepmul = n;
        }
        if let Some(n) = env_usize("LUNA_GC_STRTAB") {
            opts.strtab_size = n.next_power_of_two().max(16);
        }
        if let Ok(v) = std::env::var("LUNA_GC_MINOR") {
            opts.minor = v == "1" || v.eq_ignore_ascii_case("true");
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = GcOptions::default();
        assert_eq!(o.pause, 200);
        assert_eq!(o.stepmul, 200);
        assert!(!o.minor);
        assert!(o.strtab_size.is_power_of_two());
    }
}
