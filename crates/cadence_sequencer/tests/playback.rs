// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scheduler playback on the reference clock host.

use cadence_sequencer::{
    Blocker, ClockHost, ClockProbe, ConfigurationError, Direction, EffectError, EffectGenerator,
    HookFailure, KindTag, OwnershipError, Phase, Position, Scheduler, SchedulerConfig,
    SequencerError, StructuralError, Unit, UnitConfigPatch, UnitId,
};
use futures::channel::oneshot;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn unit_on(host: ClockHost, patch: UnitConfigPatch) -> Unit {
    Unit::builder(KindTag::Emphasis, EffectGenerator::empty())
        .config(patch)
        .build(host)
        .unwrap()
}

fn unit(duration: f64) -> Unit {
    unit_on(ClockHost::new(), UnitConfigPatch::new().with_duration(duration))
}

fn ids(units: &[Unit]) -> Vec<UnitId> {
    units.iter().map(Unit::id).collect()
}

/// Record which units finish `phase`, in order
fn record_phase(units: &[Unit], direction: Direction, phase: Phase) -> Rc<RefCell<Vec<(UnitId, Instant)>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    for unit in units {
        let sink = log.clone();
        unit.on_phase_finish(direction, phase, move |event| {
            sink.borrow_mut().push((event.unit, Instant::now()));
            Ok(())
        });
    }
    log
}

fn order(log: &Rc<RefCell<Vec<(UnitId, Instant)>>>) -> Vec<UnitId> {
    log.borrow().iter().map(|(id, _)| *id).collect()
}

#[tokio::test(start_paused = true)]
async fn test_sequential_units_play_back_to_back() {
    let scheduler = Scheduler::new(SchedulerConfig::new("Sequential")).unwrap();
    let units = [unit(100.0), unit(200.0), unit(300.0)];
    scheduler.add_units(units.clone()).unwrap();

    let unit_ids = ids(&units);
    assert_eq!(
        scheduler.forward_groupings(),
        vec![vec![unit_ids[0]], vec![unit_ids[1]], vec![unit_ids[2]]]
    );

    let started = Instant::now();
    scheduler.play().unwrap().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_millis(610));

    let status = scheduler.status();
    assert!(status.was_played && status.is_finished);
    assert!(!status.in_progress);
    assert!(status.locked_structure);
}

#[tokio::test(start_paused = true)]
async fn test_rewind_returns_to_baseline() {
    let scheduler = Scheduler::default();
    let units = [unit(100.0), unit(200.0), unit(300.0)];
    scheduler.add_units(units.clone()).unwrap();
    let finished = record_phase(&units, Direction::Backward, Phase::Active);

    scheduler.play().unwrap().await.unwrap();
    let started = Instant::now();
    scheduler.rewind().unwrap().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(600));

    let unit_ids = ids(&units);
    assert_eq!(order(&finished), vec![unit_ids[2], unit_ids[1], unit_ids[0]]);

    let status = scheduler.status();
    assert!(status.was_rewound && !status.was_played);
    assert!(!status.locked_structure);
    scheduler.add_units([unit(50.0)]).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_starts_next_unit_too_shares_start() {
    let scheduler = Scheduler::default();
    let leader = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(300.0).starting_next_unit_too(),
    );
    let follower = unit(100.0);
    scheduler.add_units([leader.clone(), follower.clone()]).unwrap();

    assert_eq!(scheduler.forward_groupings(), vec![vec![leader.id(), follower.id()]]);
    assert_eq!(leader.full_start_time(), follower.full_start_time());

    let started = Instant::now();
    scheduler.play().unwrap().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(310));
}

#[tokio::test(start_paused = true)]
async fn test_integrity_holds_early_host() {
    let scheduler = Scheduler::default();
    let slow = unit(200.0);
    // Scheduled to finish later, but its host runs four times too fast
    let hasty = unit_on(
        ClockHost::new().with_skew(4.0),
        UnitConfigPatch::new().with_duration(300.0).starting_with_previous(),
    );
    scheduler.add_units([slow.clone(), hasty.clone()]).unwrap();
    assert_eq!(scheduler.active_finish_groupings(), vec![vec![slow.id(), hasty.id()]]);

    let finished = record_phase(&[slow.clone(), hasty.clone()], Direction::Forward, Phase::Active);
    let started = Instant::now();
    scheduler.play().unwrap().await.unwrap();

    assert_eq!(order(&finished), vec![slow.id(), hasty.id()]);
    let log = finished.borrow();
    assert!(log[1].1.duration_since(started) >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_integrity_orders_end_delays() {
    let scheduler = Scheduler::default();
    let a = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(100.0).with_end_delay(300.0),
    );
    let b = unit_on(
        ClockHost::new().with_skew(4.0),
        UnitConfigPatch::new()
            .with_duration(100.0)
            .with_end_delay(400.0)
            .starting_with_previous(),
    );
    scheduler.add_units([a.clone(), b.clone()]).unwrap();
    assert_eq!(scheduler.end_delay_finish_groupings(), vec![vec![a.id(), b.id()]]);

    let finished = record_phase(&[a.clone(), b.clone()], Direction::Forward, Phase::EndDelay);
    let started = Instant::now();
    scheduler.play().unwrap().await.unwrap();

    assert_eq!(order(&finished), vec![a.id(), b.id()]);
    let log = finished.borrow();
    assert!(log[1].1.duration_since(started) >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_integrity_holds_early_host_on_rewind() {
    let scheduler = Scheduler::default();
    let a = unit_on(ClockHost::new().with_skew(4.0), UnitConfigPatch::new().with_duration(200.0));
    let b = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(200.0).starting_with_previous(),
    );
    scheduler.add_units([a.clone(), b.clone()]).unwrap();
    scheduler.play().unwrap().await.unwrap();

    let finished = record_phase(&[a.clone(), b.clone()], Direction::Backward, Phase::Active);
    let started = Instant::now();
    scheduler.rewind().unwrap().await.unwrap();

    assert_eq!(order(&finished), vec![b.id(), a.id()]);
    let log = finished.borrow();
    assert!(log[1].1.duration_since(started) >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_backward_tie_prefers_later_unit() {
    let scheduler = Scheduler::default();
    let a = unit(200.0);
    let b = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(200.0).starting_with_previous(),
    );
    scheduler.add_units([a.clone(), b.clone()]).unwrap();
    assert_eq!(scheduler.backward_active_finish_groupings(), vec![vec![b.id(), a.id()]]);

    let finished = record_phase(&[a.clone(), b.clone()], Direction::Backward, Phase::Active);
    scheduler.play().unwrap().await.unwrap();
    scheduler.rewind().unwrap().await.unwrap();
    assert_eq!(order(&finished), vec![b.id(), a.id()]);
}

#[tokio::test(start_paused = true)]
async fn test_rewind_starts_at_intersection() {
    let scheduler = Scheduler::default();
    let long = unit(300.0);
    let short = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(100.0).starting_with_previous(),
    );
    scheduler.add_units([long.clone(), short.clone()]).unwrap();
    scheduler.play().unwrap().await.unwrap();

    // `short` ended at 100 going forward, so it rewinds once `long` is back there
    let started_rewinding = record_phase(&[short.clone()], Direction::Backward, Phase::Delay);
    let started = Instant::now();
    scheduler.rewind().unwrap().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(310));

    let log = started_rewinding.borrow();
    let offset = log[0].1.duration_since(started);
    assert!(offset >= Duration::from_millis(200));
    assert!(offset < Duration::from_millis(205));
}

#[tokio::test(start_paused = true)]
async fn test_finish_never_played_fast_forwards() {
    let scheduler = Scheduler::default();
    let units = [unit(1000.0), unit(1000.0), unit(1000.0)];
    scheduler.add_units(units.clone()).unwrap();

    let started = Instant::now();
    scheduler.finish().unwrap().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(5));

    let status = scheduler.status();
    assert!(status.was_played && status.is_finished);
    assert!(!status.using_finish);
}

#[tokio::test(start_paused = true)]
async fn test_finish_mid_playback() {
    let scheduler = Scheduler::default();
    scheduler.add_units([unit(400.0), unit(400.0)]).unwrap();

    let started = Instant::now();
    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(100)).await;
        scheduler.finish().unwrap().await.unwrap();
    };
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    assert!(started.elapsed() < Duration::from_millis(110));
    assert!(scheduler.status().was_played);
}

#[tokio::test(start_paused = true)]
async fn test_finish_reaches_unit_held_by_integrity() {
    let scheduler = Scheduler::default();
    let slow = unit(200.0);
    let hasty = unit_on(
        ClockHost::new().with_skew(10.0),
        UnitConfigPatch::new()
            .with_duration(300.0)
            .with_end_delay(50_000.0)
            .starting_with_previous(),
    );
    scheduler.add_units([slow.clone(), hasty.clone()]).unwrap();

    let started = Instant::now();
    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(50)).await;
        // Waiting on `slow`, but not paused
        let status = hasty.status();
        assert!(status.in_progress && status.is_running && !status.is_paused);
        scheduler.finish().unwrap().await.unwrap();
    };
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(scheduler.status().was_played);
}

#[tokio::test(start_paused = true)]
async fn test_finish_while_paused_is_noop() {
    let scheduler = Scheduler::default();
    scheduler.add_units([unit(200.0)]).unwrap();

    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(50)).await;
        scheduler.pause();
        let before = scheduler.status();
        scheduler.finish().unwrap().await.unwrap();
        assert_eq!(scheduler.status(), before);
        assert!(before.is_paused && !before.using_finish);

        sleep(Duration::from_millis(100)).await;
        scheduler.unpause();
    };
    let started = Instant::now();
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_structure_locked_while_played() {
    let scheduler = Scheduler::default();
    let member = unit(100.0);
    scheduler.add_units([member.clone()]).unwrap();

    let playing = scheduler.play().unwrap();
    assert_eq!(
        scheduler.add_units([unit(100.0)]),
        Err(StructuralError::Locked(scheduler.id()))
    );
    playing.await.unwrap();

    assert_eq!(
        scheduler.remove_units(&[member.id()]),
        Err(StructuralError::Locked(scheduler.id()))
    );
    assert!(matches!(
        member.set_config(&UnitConfigPatch::new().with_duration(50.0)),
        Err(SequencerError::Structural(StructuralError::Locked(_)))
    ));

    scheduler.rewind().unwrap().await.unwrap();
    scheduler.remove_units(&[member.id()]).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_owned_units_reject_direct_control() {
    let scheduler = Scheduler::default();
    let member = unit(100.0);
    scheduler.add_units([member.clone()]).unwrap();

    let expected = SequencerError::Ownership(OwnershipError::Bypassed {
        unit: member.id(),
        owner: scheduler.id(),
    });
    assert_eq!(member.play().err(), Some(expected.clone()));
    assert_eq!(member.pause().err(), Some(expected));

    scheduler.remove_units(&[member.id()]).unwrap();
    member.play().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hook_failure_pauses_scheduler() {
    let scheduler = Scheduler::default();
    let units = [unit(100.0), unit(100.0)];
    units[0].on_phase_finish(Direction::Forward, Phase::Active, |_| Err(HookFailure::new("boom")));
    scheduler.add_units(units.clone()).unwrap();

    let error = scheduler.play().unwrap().await.unwrap_err();
    assert!(matches!(
        error,
        SequencerError::Effect(EffectError::Hook { phase: Phase::Active, .. })
    ));

    let status = scheduler.status();
    assert!(status.in_progress && status.is_paused);
    assert!(!units[1].status().in_progress);
}

#[tokio::test(start_paused = true)]
async fn test_finish_reports_failure() {
    let scheduler = Scheduler::default();
    let units = [unit(100.0), unit(100.0)];
    units[1].on_phase_finish(Direction::Forward, Phase::Active, |_| Err(HookFailure::new("boom")));
    scheduler.add_units(units.clone()).unwrap();

    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(20)).await;
        scheduler.finish().unwrap().await
    };
    let (played, finished) = futures::join!(playing, control);
    for result in [played, finished] {
        assert!(matches!(
            result,
            Err(SequencerError::Effect(EffectError::Hook { phase: Phase::Active, .. }))
        ));
    }
    assert!(scheduler.status().is_paused);
}

#[tokio::test(start_paused = true)]
async fn test_finalization_failure_surfaces() {
    let scheduler = Scheduler::default();
    let host = ClockHost::new().with_failing_commits(2);
    let probe = host.probe();
    let transition = Unit::builder(KindTag::Transition, EffectGenerator::empty())
        .config(UnitConfigPatch::new().with_duration(100.0).committing_final_state(true))
        .build(host)
        .unwrap();
    scheduler.add_units([transition.clone()]).unwrap();

    let error = scheduler.play().unwrap().await.unwrap_err();
    assert!(matches!(
        error,
        SequencerError::Effect(EffectError::Finalization { retried: true, .. })
    ));
    assert_eq!(probe.commit_attempts(), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_roadblock_pauses_whole_scheduler() {
    let scheduler = Scheduler::default();
    let steady_host = ClockHost::new();
    let steady_probe: ClockProbe = steady_host.probe();
    let steady = unit_on(steady_host, UnitConfigPatch::new().with_duration(400.0));
    let blocked = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(400.0).starting_with_previous(),
    );
    scheduler.add_units([steady.clone(), blocked.clone()]).unwrap();

    let (release, gate) = oneshot::channel::<()>();
    blocked
        .add_roadblocks(
            Direction::Forward,
            Phase::Active,
            Position::Percent(50.0),
            [Blocker::future(async move {
                let _ = gate.await;
            })],
        )
        .unwrap();

    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(300)).await;
        let status = scheduler.status();
        assert!(status.is_paused);
        assert!(steady.status().is_paused);
        assert!(!steady_probe.is_playing());
        release.send(()).unwrap();
    };
    let started = Instant::now();
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    // 200ms until the roadblock, 100ms held, 200ms after
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(!scheduler.status().is_paused);
}

/// A roadblock at 100ms into the active phase, cleared by the returned sender
fn gate_at_100ms(unit: &Unit) -> oneshot::Sender<()> {
    let (release, gate) = oneshot::channel::<()>();
    unit.add_roadblocks(
        Direction::Forward,
        Phase::Active,
        Position::Offset(100.0),
        [Blocker::future(async move {
            let _ = gate.await;
        })],
    )
    .unwrap();
    release
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_roadblocks_hold_until_last_clears() {
    let scheduler = Scheduler::default();
    let a = unit(400.0);
    let b = unit_on(
        ClockHost::new(),
        UnitConfigPatch::new().with_duration(400.0).starting_with_previous(),
    );
    scheduler.add_units([a.clone(), b.clone()]).unwrap();
    let release_a = gate_at_100ms(&a);
    let release_b = gate_at_100ms(&b);

    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(200)).await;
        release_a.send(()).unwrap();

        sleep(Duration::from_millis(200)).await;
        assert!(scheduler.status().is_paused);
        assert!(a.status().is_paused);
        release_b.send(()).unwrap();
    };
    let started = Instant::now();
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    // 100ms until the roadblocks, held until 400ms, 300ms after
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert!(!scheduler.status().is_paused);
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_roadblock_survives_release() {
    let scheduler = Scheduler::default();
    let member = unit(400.0);
    scheduler.add_units([member.clone()]).unwrap();
    let release = gate_at_100ms(&member);

    let playing = scheduler.play().unwrap();
    let control = async {
        sleep(Duration::from_millis(150)).await;
        scheduler.pause();
        sleep(Duration::from_millis(50)).await;
        release.send(()).unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(scheduler.status().is_paused);
        assert!(member.status().is_paused);
        scheduler.unpause();
    };
    let started = Instant::now();
    let (result, ()) = futures::join!(playing, control);
    result.unwrap();
    // 100ms until the roadblock, paused until 300ms, 300ms after
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_time_promise_on_member() {
    let scheduler = Scheduler::default();
    let units = [unit(100.0), unit(200.0)];
    scheduler.add_units(units.clone()).unwrap();

    let halfway = units[1]
        .generate_time_promise(Direction::Forward, Phase::Active, Position::Percent(50.0))
        .unwrap();
    let playing = scheduler.play().unwrap();
    let started = Instant::now();
    let watcher = async {
        halfway.await;
        started.elapsed()
    };
    let (result, reached) = futures::join!(playing, watcher);
    result.unwrap();
    assert!(reached >= Duration::from_millis(200));
    assert!(reached < Duration::from_millis(205));

    assert!(matches!(
        units[0].generate_time_promise(Direction::Forward, Phase::Active, Position::Offset(900.0)),
        Err(ConfigurationError::OffsetOutOfRange { .. })
    ));
}
