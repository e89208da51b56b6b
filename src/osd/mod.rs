//! OSD region compositor: one worker thread, woken on wall-clock second
//! boundaries, that renders each configured region and pushes it to the HAL.
//!
//! Ports `region_thread()`'s per-tick loop: macro expansion, font/image
//! rendering, grow-always/shrink-if-under-90%-area hysteresis, and
//! attach/set-bitmap/destroy via the region HAL calls.

pub mod macros;
pub mod render;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::{OsdConfig, OsdRegionConfig, MAX_OSD};
use crate::hal::{Hal, OsdRect};
use macros::MacroState;
use render::RenderedBitmap;

/// Reserved slots for the auto-generated ISP debug overlay (top/bottom line),
/// matching the original firmware's fixed choice of regions 2 and 3.
const ISP_DEBUG_SLOT_1: usize = 2;
const ISP_DEBUG_SLOT_2: usize = 3;

struct SlotState {
    attached: bool,
    width: u32,
    height: u32,
}

impl SlotState {
    fn new() -> Self {
        SlotState { attached: false, width: 0, height: 0 }
    }
}

pub struct OsdCompositor {
    hal: Arc<dyn Hal>,
    regions: Mutex<Vec<OsdRegionConfig>>,
    slots: Mutex<Vec<SlotState>>,
    macro_state: MacroState,
    time_format: String,
    isp_debug: bool,
    /// Channels that accept OSD attachment (grayscale/night-only channels may opt out).
    osd_capable_channels: Vec<u32>,
    running: AtomicBool,
}

impl OsdCompositor {
    pub fn new(hal: Arc<dyn Hal>, config: &OsdConfig, time_format: String, osd_capable_channels: Vec<u32>) -> Self {
        let mut regions = config.regions.clone();
        regions.resize(MAX_OSD, OsdRegionConfig::default());
        let slots = (0..MAX_OSD).map(|_| SlotState::new()).collect();
        OsdCompositor {
            hal,
            regions: Mutex::new(regions),
            slots: Mutex::new(slots),
            macro_state: MacroState::new(),
            time_format,
            isp_debug: config.isp_debug,
            osd_capable_channels,
            running: AtomicBool::new(true),
        }
    }

    pub fn set_region(&self, id: usize, region: OsdRegionConfig) {
        if id < MAX_OSD {
            self.regions.lock()[id] = region;
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("osd-compositor".into())
            .stack_size(320 * 1024)
            .spawn(move || self.run())
            .expect("spawn osd-compositor thread")
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            for id in 0..MAX_OSD {
                if self.isp_debug && (id == ISP_DEBUG_SLOT_1 || id == ISP_DEBUG_SLOT_2) {
                    self.tick_isp_debug_slot(id);
                    continue;
                }
                self.tick_slot(id);
            }
            self.sleep_to_next_second();
        }
    }

    fn tick_isp_debug_slot(&self, id: usize) {
        let line_no = if id == ISP_DEBUG_SLOT_1 { 1 } else { 2 };
        let macro_text = format!("$I{line_no}");
        let region = self.regions.lock()[id].clone();
        if !region.text.is_empty() || !region.image_path.is_empty() {
            // User claimed this slot; don't override it with the auto overlay.
            self.tick_slot(id);
            return;
        }
        self.render_and_attach_text(id, &region, &macro_text);
    }

    fn tick_slot(&self, id: usize) {
        let region = self.regions.lock()[id].clone();
        if !self.osd_capable_channels.is_empty() && !self.channel_accepts_osd(id) {
            return;
        }
        if !region.text.is_empty() {
            self.render_and_attach_text(id, &region, &region.text.clone());
        } else if !region.image_path.is_empty() {
            self.render_and_attach_image(id, &region);
        } else {
            let _ = self.hal.region_destroy(id as u32);
            self.slots.lock()[id] = SlotState::new();
        }
    }

    fn channel_accepts_osd(&self, _id: usize) -> bool {
        true
    }

    fn render_and_attach_text(&self, id: usize, region: &OsdRegionConfig, raw_text: &str) {
        let expanded = macros::expand(raw_text, &self.time_format, &self.macro_state, self.hal.as_ref());
        let Some(font_path) = resolve_font_path(&region.font) else {
            tracing::warn!(region = id, font = %region.font, "font not found, skipping OSD update");
            return;
        };
        let Ok(font_data) = std::fs::read(&font_path) else { return };
        let rendered = match render::render_text(region, &expanded, &font_data) {
            Ok(r) => r,
            Err(_) => return,
        };
        self.attach(id, region, rendered);
    }

    fn render_and_attach_image(&self, id: usize, region: &OsdRegionConfig) {
        let path = if region.image_path.is_empty() { format!("/tmp/osd{id}.bmp") } else { region.image_path.clone() };
        let Ok(bytes) = std::fs::read(&path) else {
            let _ = self.hal.region_destroy(id as u32);
            self.slots.lock()[id] = SlotState::new();
            return;
        };
        let decoded = if path.ends_with(".png") { render::decode_png(&bytes) } else { render::decode_bmp(&bytes) };
        let Ok(rendered) = decoded else { return };
        self.attach(id, region, rendered);
    }

    /// Applies size hysteresis and calls into the HAL to attach/update the region.
    fn attach(&self, id: usize, region: &OsdRegionConfig, rendered: RenderedBitmap) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[id];

        let need_grow = rendered.width > slot.width || rendered.height > slot.height;
        let cur_area = slot.width as u64 * slot.height as u64;
        let new_area = rendered.width as u64 * rendered.height as u64;
        let shrink_allowed = slot.attached && new_area * 100 <= cur_area * 90;

        let (final_bitmap, target_w, target_h) = if !slot.attached || need_grow || shrink_allowed {
            let w = rendered.width;
            let h = rendered.height;
            (rendered, w, h)
        } else {
            let w = slot.width;
            let h = slot.height;
            (render::pad_bitmap(&rendered, w, h), w, h)
        };

        if !slot.attached || target_w != slot.width || target_h != slot.height {
            let rect = OsdRect { x: region.position_x as i32, y: region.position_y as i32, width: target_w, height: target_h };
            if self.hal.region_create(id as u32, rect, region.opacity_fg, region.opacity_bg).is_err() {
                return;
            }
            slot.attached = true;
            slot.width = target_w;
            slot.height = target_h;
        }

        let _ = self.hal.region_set_bitmap(id as u32, &final_bitmap.into());
    }

    fn sleep_to_next_second(&self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut remaining_ms = 1000u64.saturating_sub(now.subsec_millis() as u64);
        while self.running.load(Ordering::SeqCst) && remaining_ms > 0 {
            let step = remaining_ms.min(50);
            std::thread::sleep(Duration::from_millis(step));
            remaining_ms -= step;
        }
    }
}

const FONT_SEARCH_DIRS: &[&str] = &[".", "/oem/usr/share", "/usr/local/share/fonts", "/usr/share/fonts/truetype", "/usr/share/fonts"];

/// Resolves a configured font name or path to a file on disk, the way
/// `region_resolve_font_path()` does: an explicit path (containing `/`) is
/// used as-is; otherwise every search directory is tried with `.ttf`/`.otf`/
/// `.ttc` extensions.
fn resolve_font_path(cfg: &str) -> Option<String> {
    if cfg.contains('/') {
        return std::path::Path::new(cfg).exists().then(|| cfg.to_string());
    }
    for dir in FONT_SEARCH_DIRS {
        for ext in [".ttf", ".otf", ".ttc"] {
            let candidate = format!("{dir}/{cfg}{ext}");
            if std::path::Path::new(&candidate).exists() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::null::NullHal;

    fn test_compositor() -> OsdCompositor {
        let hal: Arc<dyn Hal> = Arc::new(NullHal::new());
        OsdCompositor::new(hal, &OsdConfig::default(), "%H:%M:%S".to_string(), vec![])
    }

    #[test]
    fn empty_region_is_left_unattached() {
        let comp = test_compositor();
        comp.tick_slot(0);
        assert!(!comp.slots.lock()[0].attached);
    }

    #[test]
    fn size_hysteresis_grows_but_does_not_shrink_under_threshold() {
        let comp = test_compositor();
        let region = OsdRegionConfig::default();
        comp.attach(0, &region, RenderedBitmap { width: 100, height: 40, pixels: vec![0; 4000] });
        assert_eq!((comp.slots.lock()[0].width, comp.slots.lock()[0].height), (100, 40));

        // New area 100*38 = 3800, which is > 90% of 4000 (3600) -> pad, don't shrink.
        comp.attach(0, &region, RenderedBitmap { width: 100, height: 38, pixels: vec![0; 3800] });
        assert_eq!((comp.slots.lock()[0].width, comp.slots.lock()[0].height), (100, 40));
    }

    #[test]
    fn size_hysteresis_shrinks_when_area_drops_below_90_percent() {
        let comp = test_compositor();
        let region = OsdRegionConfig::default();
        comp.attach(0, &region, RenderedBitmap { width: 100, height: 40, pixels: vec![0; 4000] });
        // New area 50*40 = 2000, <= 90% of 4000 -> shrink.
        comp.attach(0, &region, RenderedBitmap { width: 50, height: 40, pixels: vec![0; 2000] });
        assert_eq!((comp.slots.lock()[0].width, comp.slots.lock()[0].height), (50, 40));
    }
}
