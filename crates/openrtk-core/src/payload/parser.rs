//! Combined firmware image splitting.
//!
//! A combined image carries several sub-images, each introduced by a textual
//! marker (e.g. `rtk_start:`) followed by a little-endian size field of
//! `marker_width` bytes and then the sub-image itself. Rules are applied in
//! order; a marker that is absent yields an empty segment.

use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::constants::{FIRMWARE_ALIGNMENT, FIRMWARE_PAD_BYTE};

/// How to locate one named sub-image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRule {
    pub name: String,
    pub marker: String,
    pub marker_width: usize,
}

impl SplitRule {
    pub fn new(name: impl Into<String>, marker: impl Into<String>, marker_width: usize) -> Self {
        Self {
            name: name.into(),
            marker: marker.into(),
            marker_width,
        }
    }
}

/// Rule table for the INS401 combined image.
pub fn default_rules() -> Vec<SplitRule> {
    vec![
        SplitRule::new("rtk", "rtk_start:", 4),
        SplitRule::new("ins", "ins_start:", 4),
        SplitRule::new("sdk", "sdk_start:", 4),
        SplitRule::new("imu", "imu_start:", 4),
    ]
}

/// A named byte range of the combined image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub range: Range<usize>,
}

impl Segment {
    pub fn size(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// First occurrence of `marker` that does not fall inside a segment already
/// located; segment bodies are opaque and may contain marker bytes.
fn locate_marker(data: &[u8], marker: &[u8], located: &[Segment]) -> Option<usize> {
    let mut from = 0;
    while from < data.len() {
        let at = from + find(&data[from..], marker)?;
        match located.iter().find(|s| s.range.contains(&at)) {
            Some(inside) => from = inside.range.end,
            None => return Some(at),
        }
    }
    None
}

/// Locate every rule's segment. Never fails: anything that cannot be located
/// cleanly becomes an empty segment.
pub fn split(data: &[u8], rules: &[SplitRule]) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::with_capacity(rules.len());

    for rule in rules {
        let empty = Segment {
            name: rule.name.clone(),
            range: 0..0,
        };

        let Some(at) = locate_marker(data, rule.marker.as_bytes(), &segments) else {
            debug!(rule = %rule.name, "Marker not present");
            segments.push(empty);
            continue;
        };

        if !(1..=8).contains(&rule.marker_width) {
            warn!(rule = %rule.name, width = rule.marker_width, "Unsupported size field width");
            segments.push(empty);
            continue;
        }

        let size_at = at + rule.marker.len();
        let start = size_at + rule.marker_width;
        if start > data.len() {
            warn!(rule = %rule.name, "Size field truncated");
            segments.push(empty);
            continue;
        }

        let declared = LittleEndian::read_uint(&data[size_at..start], rule.marker_width) as usize;
        let end = start.saturating_add(declared).min(data.len());
        if end - start < declared {
            warn!(
                rule = %rule.name,
                declared,
                available = end - start,
                "Segment truncated by end of image"
            );
        }

        let range = start..end;
        if let Some(other) = segments
            .iter()
            .find(|s| s.range.start < range.end && range.start < s.range.end)
        {
            warn!(rule = %rule.name, overlaps = %other.name, "Overlapping segment ignored");
            segments.push(empty);
            continue;
        }

        debug!(rule = %rule.name, offset = start, size = range.len(), "Segment located");
        segments.push(Segment {
            name: rule.name.clone(),
            range,
        });
    }

    segments
}

/// Pad `content` with 0xFF up to the next 16-byte boundary.
pub fn format_firmware_content(content: &[u8]) -> Vec<u8> {
    let mut padded = content.to_vec();
    let rem = padded.len() % FIRMWARE_ALIGNMENT;
    if rem != 0 {
        padded.resize(padded.len() + FIRMWARE_ALIGNMENT - rem, FIRMWARE_PAD_BYTE);
    }
    padded
}

/// A combined image together with its located segments.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Arc<[u8]>,
    segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn parse(data: impl Into<Arc<[u8]>>, rules: &[SplitRule]) -> Self {
        let data = data.into();
        let segments = split(&data, rules);
        Self { data, segments }
    }

    /// All segments in rule order, empty ones included.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn bytes(&self, segment: &Segment) -> &[u8] {
        &self.data[segment.range.clone()]
    }

    /// Name → bytes for every segment.
    pub fn contents(&self) -> Vec<(&str, &[u8])> {
        self.segments
            .iter()
            .map(|s| (s.name.as_str(), self.bytes(s)))
            .collect()
    }

    /// Lazy, padded content for `segment`. The image buffer is shared; the
    /// segment bytes are only copied when the supplier is called.
    pub fn supplier(&self, segment: &Segment) -> impl Fn() -> Vec<u8> + Send + Sync + 'static {
        let data = Arc::clone(&self.data);
        let range = segment.range.clone();
        move || format_firmware_content(&data[range.clone()])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
