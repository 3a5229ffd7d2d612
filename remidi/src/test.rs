use crate::{
    duration,
    player::{EventLoop, Player, TimerLoop, MAX_SPEED, MIN_SPEED},
    seq::{delta_time, Sequencer},
};
use remidi_smf::{Event, EventKind, Format, Header, Smf, Timing, Track};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

fn msg(delta: u32, bytes: &[u8]) -> Event {
    Event::new(EventKind::Message, delta, bytes)
}

fn tempo(delta: u32, micros_per_beat: u32) -> Event {
    Event::meta(delta, 0x51, &micros_per_beat.to_be_bytes()[1..])
}

fn eot(delta: u32) -> Event {
    Event::meta(delta, 0x2F, &[])
}

fn smf_with(timing: Timing, tracks: Vec<Vec<Event>>) -> Smf {
    let format = if tracks.len() > 1 {
        Format::Parallel
    } else {
        Format::SingleTrack
    };
    Smf {
        header: Header::new(format, timing),
        tracks: tracks.into_iter().map(Track::new).collect(),
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {} seconds, got {}",
        expected,
        actual
    );
}

/// One track that exercises state-bearing events around two notes:
/// program and controller at 0, a note from 0 to 0.5 s, another note at
/// 1.0 s.
fn state_file() -> Smf {
    smf_with(
        Timing::Metrical(480),
        vec![vec![
            msg(0, &[0xC0, 0x05]),
            msg(0, &[0xB0, 0x07, 0x64]),
            msg(0, &[0x90, 0x3C, 0x64]),
            msg(480, &[0x80, 0x3C, 0x00]),
            msg(480, &[0x90, 0x3E, 0x64]),
            eot(0),
        ]],
    )
}

mod sequencing {
    use super::*;

    #[test]
    fn default_tempo_places_one_beat_at_half_second() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                tempo(0, 500_000),
                msg(480, &[0x90, 0x3C, 0x40]),
                eot(0),
            ]],
        );
        let mut seq = Sequencer::new(&smf);
        assert_close(seq.next_event().unwrap().time, 0.0);
        assert_close(seq.next_event().unwrap().time, 0.5);
    }

    #[test]
    fn tempo_change_applies_after_its_own_delta() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                tempo(0, 500_000),
                msg(480, &[0x90, 0x3C, 0x40]),
                tempo(0, 250_000),
                msg(480, &[0x80, 0x3C, 0x40]),
                eot(0),
            ]],
        );
        let mut seq = Sequencer::new(&smf);
        let times: Vec<f64> = std::iter::from_fn(|| seq.next_event().map(|ev| ev.time)).collect();
        assert_eq!(times.len(), 4);
        assert_close(times[1], 0.5);
        assert_close(times[2], 0.5);
        assert_close(times[3], 0.75);
    }

    #[test]
    fn merge_is_time_ordered_with_track_index_tie_break() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![
                vec![msg(10, &[0x90, 1, 1]), msg(10, &[0x90, 2, 1]), eot(0)],
                vec![msg(10, &[0x91, 1, 1]), msg(5, &[0x91, 2, 1]), eot(0)],
            ],
        );
        let mut seq = Sequencer::new(&smf);
        let mut order = Vec::new();
        let mut last_time = 0.0;
        while let Some(ev) = seq.next_event() {
            assert!(ev.time >= last_time, "time went backwards");
            last_time = ev.time;
            order.push((ev.track, ev.event.data()[1]));
        }
        assert_eq!(order, vec![(0, 1), (1, 1), (1, 2), (0, 2)]);
        assert!(seq.is_finished());
    }

    #[test]
    fn end_of_track_is_consumed_not_yielded() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![msg(480, &[0x90, 0x3C, 0x40]), eot(100)]],
        );
        let mut seq = Sequencer::new(&smf);
        let ev = seq.next_event().unwrap();
        assert_close(ev.time, 0.5);
        assert!(seq.next_event().is_none());
        // The end-of-track delta contributes no time.
        assert_close(duration(&smf), 0.5);
    }

    #[test]
    fn smpte_division_ignores_tempo() {
        let smf = smf_with(
            Timing::Timecode {
                fps: 25,
                ticks_per_frame: 40,
            },
            vec![vec![
                msg(500, &[0x90, 0x3C, 0x40]),
                tempo(0, 250_000),
                msg(500, &[0x80, 0x3C, 0x40]),
                eot(0),
            ]],
        );
        let mut seq = Sequencer::new(&smf);
        // 25 fps * 40 ticks/frame = 1000 ticks per second.
        assert_close(seq.next_event().unwrap().time, 0.5);
        assert_close(seq.next_event().unwrap().time, 0.5);
        assert_close(seq.next_event().unwrap().time, 1.0);
    }

    #[test]
    fn delta_time_conversions() {
        assert_close(delta_time(480.0, Timing::Metrical(480), 500_000), 0.5);
        assert_close(delta_time(960.0, Timing::Metrical(480), 250_000), 0.5);
        assert_close(
            delta_time(
                1500.0,
                Timing::Timecode {
                    fps: 30,
                    ticks_per_frame: 50,
                },
                500_000,
            ),
            1.0,
        );
    }

    #[test]
    fn duration_of_empty_file_is_zero() {
        let smf = smf_with(Timing::Metrical(480), vec![vec![eot(0)]]);
        assert_close(duration(&smf), 0.0);
    }
}

mod seeking {
    use super::*;

    fn collect_seek(seq: &mut Sequencer, target: f64) -> Vec<Vec<u8>> {
        let mut passed = Vec::new();
        seq.seek(target, |ev| passed.push(ev.data().to_vec()));
        passed
    }

    #[test]
    fn passes_state_and_suppresses_notes() {
        let smf = state_file();
        let mut seq = Sequencer::new(&smf);
        let passed = collect_seek(&mut seq, 0.75);
        assert_eq!(passed, vec![vec![0xC0, 0x05], vec![0xB0, 0x07, 0x64]]);
        // The cursor resumes exactly at the first unconsumed event.
        assert_close(seq.peek().unwrap().time, 1.0);
    }

    #[test]
    fn silences_notes_held_from_playback() {
        let smf = state_file();
        let mut seq = Sequencer::new(&smf);
        for _ in 0..3 {
            seq.next_event().unwrap();
        }
        let passed = collect_seek(&mut seq, 0.75);
        assert_eq!(passed, vec![vec![0xB0, 0x7B, 0x00]]);
    }

    #[test]
    fn backward_seek_rewinds_and_silences() {
        let smf = state_file();
        let mut seq = Sequencer::new(&smf);
        for _ in 0..5 {
            seq.next_event().unwrap();
        }
        let passed = collect_seek(&mut seq, 0.25);
        assert_eq!(
            passed,
            vec![
                vec![0xC0, 0x05],
                vec![0xB0, 0x07, 0x64],
                vec![0xB0, 0x7B, 0x00],
            ]
        );
    }

    #[test]
    fn released_notes_need_no_silencing() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                msg(0, &[0x90, 0x3C, 0x64]),
                msg(10, &[0x90, 0x3C, 0x00]),
                eot(0),
            ]],
        );
        let mut seq = Sequencer::new(&smf);
        while seq.next_event().is_some() {}
        assert!(collect_seek(&mut seq, 10.0).is_empty());
    }

    #[test]
    fn tempo_stays_correct_across_seek() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                tempo(0, 250_000),
                msg(480, &[0x90, 0x3C, 0x40]),
                msg(480, &[0x80, 0x3C, 0x40]),
                eot(0),
            ]],
        );
        let mut seq = Sequencer::new(&smf);
        let passed = collect_seek(&mut seq, 0.3);
        assert_eq!(passed, vec![vec![0x51, 0x03, 0xD0, 0x90]]);
        assert_close(seq.peek().unwrap().time, 0.5);
    }
}

mod playback {
    use super::*;

    #[derive(Default)]
    struct MockLoop {
        armed: Vec<Duration>,
        disarms: usize,
    }
    impl EventLoop for MockLoop {
        fn arm_timer(&mut self, delay: Duration) {
            self.armed.push(delay);
        }
        fn disarm_timer(&mut self) {
            self.disarms += 1;
        }
        fn break_loop(&mut self) {}
    }

    fn two_note_file() -> Smf {
        smf_with(
            Timing::Metrical(480),
            vec![vec![
                msg(0, &[0x90, 0x3C, 0x40]),
                msg(240, &[0x80, 0x3C, 0x00]),
                eot(0),
            ]],
        )
    }

    fn collect<'a, L: EventLoop>(player: &mut Player<'a, L>) -> Rc<RefCell<Vec<Vec<u8>>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        player.on_event(move |ev| sink.borrow_mut().push(ev.data().to_vec()));
        events
    }

    #[test]
    fn schedules_emits_and_finishes() {
        let smf = two_note_file();
        let mut player = Player::new(&smf, MockLoop::default());
        let events = collect(&mut player);
        let finishes = Rc::new(Cell::new(0u32));
        let finished = finishes.clone();
        player.on_finish(move || finished.set(finished.get() + 1));

        player.start();
        assert_eq!(player.event_loop().armed, vec![Duration::from_secs(0)]);

        player.on_timer();
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(
            *player.event_loop().armed.last().unwrap(),
            Duration::from_secs_f64(0.25)
        );

        player.on_timer();
        assert_eq!(
            *events.borrow(),
            vec![vec![0x90, 0x3C, 0x40], vec![0x80, 0x3C, 0x00]]
        );
        assert!(!player.is_running());
        assert_eq!(player.event_loop().disarms, 1);
        assert_eq!(finishes.get(), 1);

        // Finished falls back to idle: further timer ticks do nothing.
        player.on_timer();
        assert_eq!(events.borrow().len(), 2);
        assert_eq!(finishes.get(), 1);
    }

    #[test]
    fn speed_is_clamped_and_rescales_the_deadline() {
        let smf = two_note_file();
        let mut player = Player::new(&smf, MockLoop::default());
        player.start();
        player.on_timer();

        player.set_speed(2.0);
        assert_eq!(
            *player.event_loop().armed.last().unwrap(),
            Duration::from_secs_f64(0.25 / 2.0)
        );

        player.set_speed(0.0);
        assert_eq!(player.speed(), MIN_SPEED);
        assert_eq!(
            *player.event_loop().armed.last().unwrap(),
            Duration::from_secs_f64(0.25 / MIN_SPEED)
        );

        player.set_speed(100.0);
        assert_eq!(player.speed(), MAX_SPEED);
        assert_eq!(
            *player.event_loop().armed.last().unwrap(),
            Duration::from_secs_f64(0.25 / MAX_SPEED)
        );
    }

    #[test]
    fn stop_blocks_callbacks_until_restart() {
        let smf = two_note_file();
        let mut player = Player::new(&smf, MockLoop::default());
        let events = collect(&mut player);

        player.start();
        player.on_timer();
        player.stop();
        assert_eq!(player.event_loop().disarms, 1);

        player.on_timer();
        assert_eq!(events.borrow().len(), 1, "no event may fire while stopped");

        player.start();
        player.on_timer();
        assert_eq!(events.borrow().len(), 2);
        assert!(!player.is_running());
    }

    #[test]
    fn rewind_restarts_from_zero() {
        let smf = two_note_file();
        let mut player = Player::new(&smf, MockLoop::default());
        let events = collect(&mut player);

        player.start();
        player.on_timer();
        player.rewind();
        assert_eq!(player.current_time(), 0.0);

        player.on_timer();
        assert_eq!(
            *events.borrow(),
            vec![vec![0x90, 0x3C, 0x40], vec![0x90, 0x3C, 0x40]]
        );
    }

    #[test]
    fn goto_time_replays_state_then_reschedules() {
        let smf = state_file();
        let mut player = Player::new(&smf, MockLoop::default());
        let events = collect(&mut player);

        player.start();
        player.goto_time(0.75);
        assert_eq!(player.current_time(), 0.75);
        assert_eq!(
            *events.borrow(),
            vec![vec![0xC0, 0x05], vec![0xB0, 0x07, 0x64]]
        );

        player.on_timer();
        assert_eq!(
            *player.event_loop().armed.last().unwrap(),
            Duration::from_secs_f64(0.25)
        );
        assert_eq!(events.borrow().len(), 2);
    }

    #[test]
    fn timer_loop_plays_to_the_end() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                msg(0, &[0x90, 0x3C, 0x40]),
                msg(5, &[0x80, 0x3C, 0x00]),
                eot(0),
            ]],
        );
        let mut player = Player::new(&smf, TimerLoop::new());
        let events = collect(&mut player);
        player.start();
        player.run();
        assert_eq!(events.borrow().len(), 2);
        assert!(!player.is_running());
    }

    #[test]
    fn loop_breaker_interrupts_a_blocking_run() {
        let smf = smf_with(
            Timing::Metrical(480),
            vec![vec![
                msg(0, &[0x90, 0x3C, 0x40]),
                // Roughly five seconds away; the breaker fires long before.
                msg(5000, &[0x80, 0x3C, 0x00]),
                eot(0),
            ]],
        );
        let mut player = Player::new(&smf, TimerLoop::new());
        let events = collect(&mut player);
        player.start();

        let breaker = player.event_loop().breaker();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            breaker.break_loop();
        });
        player.run();
        interrupter.join().unwrap();

        assert_eq!(events.borrow().len(), 1);
        assert!(player.is_running(), "a broken loop does not stop the player");
    }
}
