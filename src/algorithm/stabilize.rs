//! Background stabilization loop.
//!
//! Runs the algorithm's maintenance round on a dedicated thread with an
//! exponential interval: every round that changes the neighbor set resets
//! the interval to the configured minimum, quiet rounds double it up to
//! the maximum. A jitter play-ratio desynchronizes the rings of nodes
//! started at the same instant.

use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use crate::algorithm::RoutingAlgorithm;
use crate::config::Config;

enum Control {
    Suspend,
    Resume,
    Stop,
}

/// Owns the stabilization thread; dropping it stops the loop.
pub struct Stabilizer {
    control: flume::Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Stabilizer {
    pub fn start(algorithm: Arc<dyn RoutingAlgorithm>, config: &Config) -> Stabilizer {
        let (control, commands) = flume::unbounded();

        let min = config.stabilize_min;
        let max = config.stabilize_max.max(min);
        let play = config.stabilize_play.clamp(0.0, 1.0);
        let timeout = config.request_timeout;

        let handle = Builder::new()
            .name("ringroute-stabilize".into())
            .spawn(move || run(algorithm, commands, min, max, play, timeout))
            .ok();

        Stabilizer { control, handle }
    }

    pub fn suspend(&self) {
        let _ = self.control.send(Control::Suspend);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    pub fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Stabilizer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    algorithm: Arc<dyn RoutingAlgorithm>,
    commands: flume::Receiver<Control>,
    min: Duration,
    max: Duration,
    play: f64,
    timeout: Duration,
) {
    let mut interval = min;

    loop {
        match commands.recv_timeout(jittered(interval, play)) {
            Ok(Control::Stop) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Ok(Control::Suspend) => {
                debug!("stabilization suspended");
                // Block until resumed or stopped.
                loop {
                    match commands.recv() {
                        Ok(Control::Resume) => break,
                        Ok(Control::Suspend) => continue,
                        Ok(Control::Stop) | Err(_) => return,
                    }
                }
                debug!("stabilization resumed");
                interval = min;
            }
            Ok(Control::Resume) => continue,
            Err(flume::RecvTimeoutError::Timeout) => {
                let changed = algorithm.stabilize_once(timeout);
                interval = if changed {
                    min
                } else {
                    (interval * 2).min(max)
                };
                trace!(changed, next = ?interval, "stabilization round");
            }
        }
    }
}

fn jittered(interval: Duration, play: f64) -> Duration {
    if play == 0.0 {
        return interval;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-play..=play);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jitter_stays_within_play_bounds() {
        let base = Duration::from_secs(10);

        for _ in 0..100 {
            let j = jittered(base, 0.1);
            assert!(j >= Duration::from_secs(9));
            assert!(j <= Duration::from_secs(11));
        }

        assert_eq!(jittered(base, 0.0), base);
    }
}
