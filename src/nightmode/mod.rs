//! Day/night controller: one worker thread picking its light-sampling
//! source by configuration priority and driving IR-cut/IR-LED/grayscale
//! through a hysteresis-and-lockout state machine.
//!
//! Ports `night.c`'s `night_thread()`/`night_mode()`, adding the
//! `last_transition`/`lockout_s` gate the distilled system description
//! requires but the original firmware's ISP-luma branch left implicit.

pub mod gpio;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NightModeConfig;
use crate::hal::{ChannelId, Hal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Day,
    Night,
}

enum SamplingSource {
    IspLuma { low: i32, hi: i32 },
    Adc { device: String, threshold: i32 },
    Gpio { pin: u32 },
    Idle,
}

fn choose_source(config: &NightModeConfig) -> SamplingSource {
    if config.isp_lum_low >= 0 && config.isp_lum_hi >= 0 && config.isp_lum_hi > config.isp_lum_low {
        return SamplingSource::IspLuma { low: config.isp_lum_low, hi: config.isp_lum_hi };
    }
    if !config.adc_device.is_empty() {
        return SamplingSource::Adc { device: config.adc_device.clone(), threshold: config.adc_threshold };
    }
    if let Some(pin) = config.ir_sensor_pin.resolve() {
        return SamplingSource::Gpio { pin };
    }
    SamplingSource::Idle
}

pub struct NightController {
    hal: Arc<dyn Hal>,
    channel: ChannelId,
    config: NightModeConfig,
    manual: AtomicBool,
    mode: std::sync::Mutex<Mode>,
    last_transition: AtomicI64,
    running: AtomicBool,
    start: Instant,
}

impl NightController {
    pub fn new(hal: Arc<dyn Hal>, channel: ChannelId, config: NightModeConfig) -> Self {
        NightController {
            hal,
            channel,
            manual: AtomicBool::new(config.manual),
            mode: std::sync::Mutex::new(Mode::Day),
            last_transition: AtomicI64::new(i64::MIN / 2),
            running: AtomicBool::new(true),
            start: Instant::now(),
            config,
        }
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    pub fn current_mode(&self) -> Mode {
        *self.mode.lock().unwrap()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Forces a specific mode regardless of sampling, bypassing the lockout
    /// — the control API's explicit override.
    pub fn force_mode(&self, mode: Mode) {
        self.transition(mode, true);
    }

    fn now_monotonic_s(&self) -> i64 {
        self.start.elapsed().as_secs() as i64
    }

    fn lockout_elapsed(&self) -> bool {
        let last = self.last_transition.load(Ordering::SeqCst);
        self.now_monotonic_s() - last >= self.config.isp_switch_lockout_s as i64
    }

    fn maybe_transition(&self, luma_low: bool, luma_high: bool) {
        if self.manual.load(Ordering::SeqCst) {
            return;
        }
        if !self.lockout_elapsed() {
            return;
        }
        let current = self.current_mode();
        if current == Mode::Day && luma_low {
            self.transition(Mode::Night, false);
        } else if current == Mode::Night && luma_high {
            self.transition(Mode::Day, false);
        }
    }

    /// The single transition function: grayscale, then a pulsed IR-cut
    /// swap, then the IR-LED level. Order and pulse width match
    /// `night_mode()`/`night_ircut()`.
    fn transition(&self, mode: Mode, force: bool) {
        if !force && self.current_mode() == mode {
            return;
        }
        let enable_night = mode == Mode::Night;
        tracing::info!(mode = ?mode, "night mode transition");

        if self.config.grayscale {
            let _ = self.hal.channel_grayscale(self.channel, enable_night);
        }

        if let (Some(pin1), Some(pin2)) = (self.config.ir_cut_pin1.resolve(), self.config.ir_cut_pin2.resolve()) {
            let _ = gpio::pulse_pair(pin1, !enable_night, pin2, enable_night, self.config.pin_switch_delay_us * 100);
        }

        if let Some(led_pin) = self.config.ir_led_pin.resolve() {
            let _ = gpio::write(led_pin, enable_night);
        }

        *self.mode.lock().unwrap() = mode;
        self.last_transition.store(self.now_monotonic_s(), Ordering::SeqCst);
    }

    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("night-mode".into())
            .stack_size(16 * 1024)
            .spawn(move || self.run())
            .expect("spawn night-mode thread")
    }

    fn run(&self) {
        // Apply whatever mode the config implies before sampling begins.
        self.transition(Mode::Day, true);

        match choose_source(&self.config) {
            SamplingSource::IspLuma { low, hi } => self.run_isp_luma(low, hi),
            SamplingSource::Adc { device, threshold } => self.run_adc(&device, threshold),
            SamplingSource::Gpio { pin } => self.run_gpio(pin),
            SamplingSource::Idle => self.run_idle(),
        }
    }

    fn sleep_interval(&self) {
        let secs = self.config.check_interval_s.max(1);
        std::thread::sleep(Duration::from_secs(secs as u64));
    }

    fn run_isp_luma(&self, low: i32, hi: i32) {
        while self.running.load(Ordering::SeqCst) {
            if let Ok(luma) = self.hal.read_isp_ave_luma() {
                self.maybe_transition(luma <= low, luma >= hi);
            }
            self.sleep_interval();
        }
    }

    fn run_adc(&self, device: &str, threshold: i32) {
        let Ok(mut file) = std::fs::File::open(device) else {
            tracing::error!(device, "could not open ADC device");
            return;
        };
        use std::io::Read;
        let mut sum = 0i64;
        let mut count = 0u32;
        while self.running.load(Ordering::SeqCst) {
            let mut buf = [0u8; 4];
            if file.read_exact(&mut buf).is_ok() {
                sum += i32::from_ne_bytes(buf) as i64;
                count += 1;
            }
            if count == 12 {
                let avg = (sum / count as i64) as i32;
                self.maybe_transition(avg < threshold, avg >= threshold);
                sum = 0;
                count = 0;
            }
            std::thread::sleep(Duration::from_micros(self.config.check_interval_s as u64 * 1_000_000 / 12));
        }
    }

    fn run_gpio(&self, pin: u32) {
        while self.running.load(Ordering::SeqCst) {
            if let Ok(state) = gpio::read(pin) {
                self.maybe_transition(state, !state);
            }
            self.sleep_interval();
        }
    }

    fn run_idle(&self) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::null::NullHal;

    fn controller(isp_lum_low: i32, isp_lum_hi: i32, lockout_s: u32) -> NightController {
        let hal: Arc<dyn Hal> = Arc::new(NullHal::new());
        let mut config = NightModeConfig::default();
        config.isp_lum_low = isp_lum_low;
        config.isp_lum_hi = isp_lum_hi;
        config.isp_switch_lockout_s = lockout_s;
        NightController::new(hal, 0, config)
    }

    #[test]
    fn picks_isp_luma_source_when_thresholds_valid() {
        let config = NightModeConfig { isp_lum_low: 10, isp_lum_hi: 200, ..NightModeConfig::default() };
        assert!(matches!(choose_source(&config), SamplingSource::IspLuma { low: 10, hi: 200 }));
    }

    #[test]
    fn falls_back_to_idle_with_no_source_configured() {
        let config = NightModeConfig::default();
        assert!(matches!(choose_source(&config), SamplingSource::Idle));
    }

    #[test]
    fn transitions_to_night_when_luma_low() {
        let ctl = controller(10, 200, 0);
        ctl.maybe_transition(true, false);
        assert_eq!(ctl.current_mode(), Mode::Night);
    }

    #[test]
    fn lockout_suppresses_immediate_reverse_transition() {
        let ctl = controller(10, 200, 3600);
        ctl.maybe_transition(true, false);
        assert_eq!(ctl.current_mode(), Mode::Night);
        ctl.maybe_transition(false, true);
        assert_eq!(ctl.current_mode(), Mode::Night);
    }

    #[test]
    fn manual_mode_suppresses_automatic_transitions() {
        let ctl = controller(10, 200, 0);
        ctl.set_manual(true);
        ctl.maybe_transition(true, false);
        assert_eq!(ctl.current_mode(), Mode::Day);
    }

    #[test]
    fn force_mode_bypasses_manual_and_lockout() {
        let ctl = controller(10, 200, 3600);
        ctl.set_manual(true);
        ctl.force_mode(Mode::Night);
        assert_eq!(ctl.current_mode(), Mode::Night);
    }
}
