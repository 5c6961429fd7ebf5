//! Device and application identification strings.

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Application names the device reports in its version string.
pub const KNOWN_APPS: [&str; 3] = ["RTK_INS", "RAWDATA", "INS"];

/// Assumed when the reported application is not recognised.
pub const FALLBACK_APP: &str = "RTK_INS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub pn: String,
    pub sn: String,
}

impl DeviceInfo {
    /// Parse `"<name> <pn> <sn> ..."`.
    pub fn parse(text: &str) -> Result<Self, ProviderError> {
        let mut fields = text.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(pn), Some(sn)) => Ok(Self {
                name: name.to_string(),
                pn: pn.to_string(),
                sn: sn.to_string(),
            }),
            _ => Err(ProviderError::MalformedDeviceInfo(text.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_name: String,
    pub app_version: String,
    pub bootloader_version: String,
    /// The string as reported.
    pub version: String,
    /// Whether `app_name` came from the known list.
    pub matched: bool,
}

impl AppInfo {
    /// Parse `"<app> <ver> <ver> <bl> <bl>"`. Never fails; an unknown app
    /// falls back to `RTK_INS` with `matched == false`.
    pub fn parse(text: &str) -> Self {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let found = KNOWN_APPS.iter().find(|app| fields.contains(app));
        let join = |a: usize, b: usize| -> String {
            fields.get(a).copied().unwrap_or_default().to_string() + fields.get(b).copied().unwrap_or_default()
        };

        Self {
            app_name: found.copied().unwrap_or(FALLBACK_APP).to_string(),
            app_version: join(1, 2),
            bootloader_version: join(3, 4),
            version: text.trim().to_string(),
            matched: found.is_some(),
        }
    }

    /// A bootloader banner leads with `Bootloader`, or names it without any
    /// known application. An application banner merely listing its
    /// bootloader version is not one.
    pub fn is_bootloader(&self) -> bool {
        let mut words = self
            .version
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|w| !w.is_empty());
        let is_bootloader_word = |w: &str| w.eq_ignore_ascii_case("bootloader");

        match words.next() {
            Some(first) if is_bootloader_word(first) => true,
            Some(_) => !self.matched && words.any(is_bootloader_word),
            None => false,
        }
    }
}
