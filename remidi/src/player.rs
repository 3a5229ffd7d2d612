//! The wall-clock player: drives a sequencer through an external event
//! loop.

use crate::{
    prelude::*,
    seq::{SeqEvent, Sequencer},
};
use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use remidi_smf::{Event, Smf};

/// Lower bound for the playback speed factor. Non-positive requests clamp
/// here rather than being rejected.
pub const MIN_SPEED: f64 = 0.001;
/// Upper bound for the playback speed factor.
pub const MAX_SPEED: f64 = 10.0;

/// How much of each timer wait is left to the spin sleeper after the
/// interruptible channel wait returns.
const SPIN_MARGIN: Duration = Duration::from_millis(3);

/// The capability set a player needs from its event loop.
///
/// The loop must be single-threaded and cooperative: its timer callback
/// (which calls [`Player::on_timer`]) and any input callbacks never preempt
/// each other, and the one-shot timer can be re-armed from within the timer
/// callback itself.
pub trait EventLoop {
    /// Arm the one-shot timer to fire after `delay`.
    fn arm_timer(&mut self, delay: Duration);
    /// Disarm the timer; a pending callback must not fire.
    fn disarm_timer(&mut self);
    /// Ask a running loop to return to its caller at the next suspension
    /// point.
    fn break_loop(&mut self);
}

/// Plays the merged event stream of an [`Smf`] in wall clock time.
///
/// The player owns its sequencer and its event-loop handle, and borrows
/// the file, which must outlive it. All methods must be called from the
/// thread driving the loop. Time only advances when events fire; the
/// player itself never reads a clock.
pub struct Player<'a, L: EventLoop> {
    ev_loop: L,
    smf: &'a Smf,
    seq: Sequencer<'a>,
    speed: f64,
    /// Current playback position in seconds.
    time: f64,
    /// The next event, already pulled and waiting for its deadline.
    pending: Option<SeqEvent<'a>>,
    running: bool,
    event_cb: Option<Box<dyn FnMut(&Event) + 'a>>,
    finish_cb: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a, L: EventLoop> Player<'a, L> {
    pub fn new(smf: &'a Smf, ev_loop: L) -> Player<'a, L> {
        Player {
            ev_loop,
            smf,
            seq: Sequencer::new(smf),
            speed: 1.0,
            time: 0.0,
            pending: None,
            running: false,
            event_cb: None,
            finish_cb: None,
        }
    }

    /// Called for every event as it becomes due.
    pub fn on_event(&mut self, callback: impl FnMut(&Event) + 'a) {
        self.event_cb = Some(Box::new(callback));
    }

    /// Called exactly once when the sequence ends on its own.
    pub fn on_finish(&mut self, callback: impl FnMut() + 'a) {
        self.finish_cb = Some(Box::new(callback));
    }

    #[inline]
    pub fn smf(&self) -> &'a Smf {
        self.smf
    }

    #[inline]
    pub fn event_loop(&mut self) -> &mut L {
        &mut self.ev_loop
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current playback position in seconds.
    #[inline]
    pub fn current_time(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Start or resume playback. Arms a zero-delay timer so the first tick
    /// computes a fresh deadline.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.ev_loop.arm_timer(Duration::from_secs(0));
    }

    /// Stop playback. No further event callback fires until restarted.
    /// Callers are responsible for silencing notes they have sounded.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.ev_loop.disarm_timer();
    }

    /// Reset to the beginning without changing the run state.
    pub fn rewind(&mut self) {
        self.seq.rewind();
        self.time = 0.0;
        self.pending = None;
        if self.running {
            self.ev_loop.arm_timer(Duration::from_secs(0));
        }
    }

    /// Jump to `target` seconds. State-bearing events encountered on the
    /// way (tempo, program, controllers, pitch bend) are replayed through
    /// the event callback, followed by an all-notes-off for every channel
    /// that held a note; notes themselves are not replayed.
    pub fn goto_time(&mut self, target: f64) {
        let target = if target.is_finite() && target > 0.0 {
            target
        } else {
            0.0
        };
        let event_cb = &mut self.event_cb;
        self.seq.seek(target, |event| {
            if let Some(callback) = event_cb.as_mut() {
                callback(event);
            }
        });
        self.time = target;
        self.pending = None;
        if self.running {
            self.ev_loop.arm_timer(Duration::from_secs(0));
        }
    }

    /// Change the playback speed factor, clamped into
    /// [`MIN_SPEED`]..=[`MAX_SPEED`]. The outstanding deadline is rescaled.
    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() {
            self.speed = speed.max(MIN_SPEED).min(MAX_SPEED);
        }
        if self.running {
            if let Some(pending) = self.pending {
                self.arm_for(pending.time);
            }
        }
    }

    /// Entry point for the event loop's timer callback.
    ///
    /// Emits every event due at the current position, then either arms the
    /// timer for the next event or finishes. Events are emitted back to
    /// back; the only suspension points are between them.
    pub fn on_timer(&mut self) {
        if !self.running {
            return;
        }
        if let Some(pending) = self.pending.take() {
            self.time = pending.time;
            self.emit(pending.event);
        }
        while let Some(ev) = self.seq.next_event() {
            if ev.time <= self.time {
                self.emit(ev.event);
            } else {
                self.pending = Some(ev);
                self.arm_for(ev.time);
                return;
            }
        }
        self.running = false;
        self.ev_loop.disarm_timer();
        if let Some(callback) = self.finish_cb.as_mut() {
            callback();
        }
    }

    fn arm_for(&mut self, event_time: f64) {
        let delay = (event_time - self.time).max(0.0) / self.speed;
        self.ev_loop.arm_timer(Duration::from_secs_f64(delay));
    }

    fn emit(&mut self, event: &Event) {
        if let Some(callback) = self.event_cb.as_mut() {
            callback(event);
        }
    }
}

impl<'a> Player<'a, TimerLoop> {
    /// Drive this player's [`TimerLoop`] on the current thread until the
    /// sequence finishes, the player is stopped, or the loop is broken.
    pub fn run(&mut self) {
        TimerLoop::run(self)
    }
}

enum LoopCtl {
    Break,
}

/// A reference [`EventLoop`] built on an interruptible channel wait.
///
/// Waits are satisfied with `recv_timeout` so a [`LoopBreaker`] can break
/// them from any thread, and finished with a spin sleep for
/// sub-millisecond accuracy. Everything else is single-threaded: callbacks
/// run on the thread inside [`TimerLoop::run`], and after a break returns
/// no callback is in flight.
pub struct TimerLoop {
    deadline: Option<Instant>,
    ctl: Receiver<LoopCtl>,
    breaker: Sender<LoopCtl>,
    interrupted: bool,
}

impl TimerLoop {
    pub fn new() -> TimerLoop {
        let (breaker, ctl) = channel::unbounded();
        TimerLoop {
            deadline: None,
            ctl,
            breaker,
            interrupted: false,
        }
    }

    /// A cloneable handle that can break a blocking [`TimerLoop::run`]
    /// from another thread.
    pub fn breaker(&self) -> LoopBreaker {
        LoopBreaker(self.breaker.clone())
    }

    /// Drive `player` until it finishes, is stopped, or the loop is
    /// broken.
    pub fn run(player: &mut Player<'_, TimerLoop>) {
        // Breaks sent while the loop was not running are stale.
        while player.event_loop().ctl.try_recv().is_ok() {}
        loop {
            let deadline = match player.event_loop().deadline {
                Some(deadline) => deadline,
                None => return,
            };
            let now = Instant::now();
            if deadline > now {
                let wait = deadline - now;
                if wait > SPIN_MARGIN {
                    match player.event_loop().ctl.recv_timeout(wait - SPIN_MARGIN) {
                        Ok(LoopCtl::Break) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {}
                    }
                }
                let now = Instant::now();
                if deadline > now {
                    spin_sleep::sleep(deadline - now);
                }
            }
            player.event_loop().deadline = None;
            player.on_timer();
            if std::mem::take(&mut player.event_loop().interrupted) {
                return;
            }
        }
    }
}

impl Default for TimerLoop {
    fn default() -> TimerLoop {
        TimerLoop::new()
    }
}

impl EventLoop for TimerLoop {
    fn arm_timer(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }
    fn disarm_timer(&mut self) {
        self.deadline = None;
    }
    fn break_loop(&mut self) {
        self.interrupted = true;
    }
}

/// Breaks a blocking [`TimerLoop::run`] from another thread.
#[derive(Clone)]
pub struct LoopBreaker(Sender<LoopCtl>);

impl LoopBreaker {
    pub fn break_loop(&self) {
        let _ = self.0.send(LoopCtl::Break);
    }
}
