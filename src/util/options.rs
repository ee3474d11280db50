use crate::util::constants::*;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        /// Runtime options, each settable through an environment variable
        /// with the `PGAS_` prefix (e.g. `PGAS_BLOCK_SIZE`).
        #[derive(Debug, Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }

        impl Options {
            /// Set an option from its string representation. Returns true if
            /// the key is known and the value parses and validates.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // Environment variables that start with PGAS_ and match an
                // option name (such as PGAS_CACHE_SIZE) override the default.
                const PREFIX: &str = "PGAS_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Size of the process group hosted by this process (one worker per rank).
    ranks:                  usize [|v: &usize| *v > 0] = num_cpus::get(),
    /// Workers per rank. Only 1 is supported by the in-process group; the
    /// option exists so launchers can pass the canonical configuration
    /// explicitly.
    workers_per_process:    usize [|v: &usize| *v > 0] = 1,
    /// Coherence block size in bytes. Power of two, at least one OS page.
    block_size:             usize [|v: &usize| v.is_power_of_two() && *v >= BYTES_IN_PAGE] = DEFAULT_BLOCK_SIZE,
    /// Physical cache pool size per rank, in bytes.
    cache_size:             usize [|v: &usize| *v > 0] = DEFAULT_CACHE_SIZE,
    /// Per-rank arena for noncollective allocations, in bytes.
    local_heap_size:        usize [|v: &usize| *v > 0] = DEFAULT_LOCAL_HEAP_SIZE,
    /// Treat all ranks as one node and map home segments directly instead of
    /// running the replica-cache protocol.
    enable_shared_memory:   bool  [always_valid] = true,
    /// Bind home memory to NUMA nodes according to the region's home policy.
    numa_enabled:           bool  [always_valid] = false,
    /// Bound on collective virtual address reservation rounds.
    max_reservation_trials: usize [|v: &usize| *v > 0] = DEFAULT_MAX_RESERVATION_TRIALS,
}

impl Options {
    /// Cache size rounded down to a whole number of blocks, with at least one
    /// block.
    pub fn effective_cache_size(&self) -> usize {
        let rounded = (self.cache_size / self.block_size) * self.block_size;
        if rounded == 0 {
            warn!(
                "cache_size {} smaller than block_size {}; using one block",
                self.cache_size, self.block_size
            );
            self.block_size
        } else {
            rounded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_env};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.block_size, DEFAULT_BLOCK_SIZE);
            assert_eq!(options.cache_size, DEFAULT_CACHE_SIZE);
        })
    }

    #[test]
    fn with_valid_env_var() {
        with_env(&[("CACHE_SIZE", "4194304".to_string())], || {
            let options = Options::default();
            assert_eq!(options.cache_size, 4194304);
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        // not a power of two: fall back to the default
        with_env(&[("BLOCK_SIZE", "65537".to_string())], || {
            let options = Options::default();
            assert_eq!(options.block_size, DEFAULT_BLOCK_SIZE);
        })
    }

    #[test]
    fn with_unparsable_env_var_value() {
        with_env(&[("RANKS", "abc".to_string())], || {
            let options = Options::default();
            assert_eq!(options.ranks, num_cpus::get());
        })
    }

    #[test]
    fn bool_option_from_env_var() {
        with_env(&[("ENABLE_SHARED_MEMORY", "false".to_string())], || {
            let options = Options::default();
            assert!(!options.enable_shared_memory);
        })
    }

    #[test]
    fn cache_rounds_down_to_blocks() {
        serial_test(|| {
            let mut options = Options::default();
            options.block_size = 0x10000;
            options.cache_size = 0x18000;
            assert_eq!(options.effective_cache_size(), 0x10000);
            options.cache_size = 0x1000;
            assert_eq!(options.effective_cache_size(), 0x10000);
        })
    }
}
