//! Deterministic, session-scoped label obfuscation (spec.md §4.2).

use std::collections::HashMap;
use std::sync::Mutex;

use sha256_fallback::hex_hash;

/// Per-session obfuscation maps (spec.md §3 ObfuscationMaps). Retained in
/// memory only; never serialized into an archive.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ObfuscationMaps {
    pub instance: HashMap<String, String>,
    pub job: HashMap<String, String>,
    pub custom: HashMap<String, HashMap<String, String>>,
}

struct Counters {
    instance: u32,
    job_by_component: HashMap<String, u32>,
    custom_by_key: HashMap<String, u32>,
}

/// Concurrency-safe, session-scoped anonymizer for `instance`, `job` and
/// custom labels (spec.md §4.2).
pub struct Obfuscator {
    instance_map: Mutex<HashMap<String, String>>,
    job_map: Mutex<HashMap<String, String>>,
    custom_map: Mutex<HashMap<String, HashMap<String, String>>>,
    counters: Mutex<Counters>,
}

impl Obfuscator {
    pub fn new() -> Self {
        Self {
            instance_map: Mutex::new(HashMap::new()),
            job_map: Mutex::new(HashMap::new()),
            custom_map: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters {
                instance: 1,
                job_by_component: HashMap::new(),
                custom_by_key: HashMap::new(),
            }),
        }
    }

    /// Anonymize a `host:port` instance label. The fake IP pool reserves
    /// `777.777.*.*` (obviously non-routable); the last two octets come
    /// from a monotonically-increasing counter (starting at 1) wrapped
    /// modulo 256. Port is always preserved. Inputs without a valid
    /// `host:port` structure fall back to a hex hash of the whole input.
    pub fn obfuscate_instance(&self, instance: &str) -> String {
        if let Some(existing) = self.instance_map.lock().unwrap().get(instance) {
            return existing.clone();
        }

        let fake = match instance.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                let mut counters = self.counters.lock().unwrap();
                let n = counters.instance;
                counters.instance = counters.instance.wrapping_add(1);
                let octet = n % 256;
                format!("777.777.{octet}.{octet}:{port}")
            }
            _ => format!("hashed-{}", hex_hash(instance)),
        };

        self.instance_map.lock().unwrap().insert(instance.to_string(), fake.clone());
        fake
    }

    /// Anonymize a job label, guessing the owning component from the
    /// caller-supplied `component` string (spec.md §4.4 step 3 describes
    /// how the component is derived upstream). Produces
    /// `vm_component_<component>_<n>` with an independent counter per
    /// component.
    pub fn obfuscate_job(&self, job: &str, component: &str) -> String {
        let key = format!("{component}\u{0}{job}");
        if let Some(existing) = self.job_map.lock().unwrap().get(&key) {
            return existing.clone();
        }

        let fake = {
            let mut counters = self.counters.lock().unwrap();
            let n = counters.job_by_component.entry(component.to_string()).or_insert(1);
            let current = *n;
            *n = n.wrapping_add(1);
            format!("vm_component_{component}_{current}")
        };

        self.job_map.lock().unwrap().insert(key, fake.clone());
        fake
    }

    /// Anonymize a custom label value, producing `<key>-<n>` with an
    /// independent counter per label key.
    pub fn obfuscate_custom_label(&self, key: &str, value: &str) -> String {
        {
            let custom = self.custom_map.lock().unwrap();
            if let Some(map) = custom.get(key) {
                if let Some(existing) = map.get(value) {
                    return existing.clone();
                }
            }
        }

        let fake = {
            let mut counters = self.counters.lock().unwrap();
            let n = counters.custom_by_key.entry(key.to_string()).or_insert(1);
            let current = *n;
            *n = n.wrapping_add(1);
            format!("{key}-{current}")
        };

        self.custom_map
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string(), fake.clone());
        fake
    }

    /// Defensive-copy snapshot of the current mappings. Callers cannot
    /// mutate internal state through the returned value.
    pub fn get_mappings(&self) -> ObfuscationMaps {
        ObfuscationMaps {
            instance: self.instance_map.lock().unwrap().clone(),
            job: self.job_map.lock().unwrap().clone(),
            custom: self.custom_map.lock().unwrap().clone(),
        }
    }
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal, dependency-free hex digest used only as the obfuscator's
/// fallback path for instance strings that don't look like `host:port`.
/// Not cryptographic; this is label scrambling, not an integrity check
/// (the archive's content hash in `bridge-archive` uses real SHA-256).
mod sha256_fallback {
    pub fn hex_hash(input: &str) -> String {
        // FNV-1a, 64-bit: fast, stable across runs within a process, and
        // sufficient for "obviously different from the original" output.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        format!("{hash:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscate_instance_is_deterministic_within_a_session() {
        let ob = Obfuscator::new();
        let a = ob.obfuscate_instance("10.0.1.5:8482");
        let b = ob.obfuscate_instance("10.0.1.5:8482");
        assert_eq!(a, b);
    }

    #[test]
    fn obfuscate_instance_preserves_port_and_uses_fake_pool() {
        let ob = Obfuscator::new();
        let fake = ob.obfuscate_instance("10.0.1.5:8482");
        assert!(fake.starts_with("777.777."));
        assert!(fake.ends_with(":8482"));
    }

    #[test]
    fn obfuscate_instance_assigns_distinct_addresses() {
        let ob = Obfuscator::new();
        let a = ob.obfuscate_instance("10.0.1.5:8482");
        let b = ob.obfuscate_instance("10.0.1.6:8482");
        assert_ne!(a, b);
    }

    #[test]
    fn obfuscate_instance_falls_back_to_hash_for_malformed_input() {
        let ob = Obfuscator::new();
        let fake = ob.obfuscate_instance("not-a-host-port");
        assert!(!fake.starts_with("777.777."));
        assert!(fake.starts_with("hashed-"));
    }

    #[test]
    fn obfuscate_job_uses_component_prefix_and_independent_counters() {
        let ob = Obfuscator::new();
        let a = ob.obfuscate_job("vmstorage-prod", "vmstorage");
        assert_eq!(a, "vm_component_vmstorage_1");
        let b = ob.obfuscate_job("vminsert-prod", "vminsert");
        assert_eq!(b, "vm_component_vminsert_1");
        let c = ob.obfuscate_job("vmstorage-dev", "vmstorage");
        assert_eq!(c, "vm_component_vmstorage_2");
    }

    #[test]
    fn obfuscate_custom_label_memoizes() {
        let ob = Obfuscator::new();
        let a = ob.obfuscate_custom_label("region", "us-east-1");
        let b = ob.obfuscate_custom_label("region", "us-east-1");
        assert_eq!(a, b);
        assert_eq!(a, "region-1");
        let c = ob.obfuscate_custom_label("region", "us-west-2");
        assert_eq!(c, "region-2");
    }

    #[test]
    fn mappings_snapshot_is_a_defensive_copy() {
        let ob = Obfuscator::new();
        ob.obfuscate_instance("10.0.1.5:8482");
        let mut snapshot = ob.get_mappings();
        snapshot.instance.insert("tampered".into(), "tampered".into());
        assert!(!ob.get_mappings().instance.contains_key("tampered"));
    }

    #[test]
    fn scenario_2_fixed_mapping_example() {
        // spec.md §8 scenario 2 literal mapping.
        let ob = Obfuscator::new();
        let fake_instance = ob.obfuscate_instance("10.0.1.5:8482");
        assert_eq!(fake_instance, "777.777.1.1:8482");
        let fake_job = ob.obfuscate_job("vmstorage-prod", "vmstorage");
        assert_eq!(fake_job, "vm_component_vmstorage_1");
    }
}
