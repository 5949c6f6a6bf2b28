use chrono::Local;
use tracing::{info, warn};

use crate::storage::{DurableStore, DEVICE_ID_KEY};

/// 32-bit rolling string hash (`h = h * 31 + c` over UTF-16 units).
pub fn hash_u32(s: &str) -> u32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c))) as u32
}

/// [`hash_u32`] rendered as 8 lowercase hex digits.
pub fn hash_string(s: &str) -> String {
    format!("{:08x}", hash_u32(s))
}

/// What the machine and session look like from the inside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub user: String,
    pub host: String,
    pub terminal: String,
    pub locale: String,
    pub platform: String,
    pub utc_offset_secs: i32,
}

impl Fingerprint {
    pub fn collect() -> Self {
        let env = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
                .unwrap_or_default()
        };
        let host = std::fs::read_to_string("/etc/hostname")
            .map(|h| h.trim().to_string())
            .unwrap_or_else(|_| env(&["HOSTNAME", "COMPUTERNAME"]));

        Self {
            user: env(&["USER", "USERNAME"]),
            host,
            terminal: env(&["TERM_PROGRAM", "TERM"]),
            locale: env(&["LC_ALL", "LANG"]),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            utc_offset_secs: Local::now().offset().local_minus_utc(),
        }
    }

    pub fn canonical(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.user, self.host, self.terminal, self.locale, self.platform, self.utc_offset_secs
        )
    }
}

/// Stored device id, or a fresh one derived from `fingerprint` and saved.
pub fn device_id(store: &dyn DurableStore, fingerprint: &Fingerprint) -> String {
    if let Some(id) = store.get(DEVICE_ID_KEY).filter(|id| !id.is_empty()) {
        info!(device_id = %id, "retrieved existing device id");
        return id;
    }
    let id = hash_string(&fingerprint.canonical());
    if let Err(err) = store.set(DEVICE_ID_KEY, &id) {
        warn!(%err, "could not persist device id");
    }
    info!(device_id = %id, "generated new device id");
    id
}
