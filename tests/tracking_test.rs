mod common;

use common::{Scripted, flat_frame, hit, miss, region, stub_recipe};
use recipe_track::error::TrackLostReason;
use recipe_track::{
    Health, MatchResult, SearchScope, TrackLost, TrackState, TrackerConfig, TrackingResult,
    TrackingStateMachine,
};

fn config() -> TrackerConfig {
    TrackerConfig {
        // Keep the detector out of TRACK unless a test asks for it.
        revalidate_interval: 1000,
        ..Default::default()
    }
}

fn machine(
    config: TrackerConfig,
    detector: Scripted,
    tracker: Scripted,
) -> TrackingStateMachine {
    TrackingStateMachine::with_localizers(
        stub_recipe("widget"),
        config,
        Box::new(detector),
        Box::new(tracker),
    )
}

fn run(machine: &mut TrackingStateMachine, first: u64, count: u64) -> Vec<TrackingResult> {
    (first..first + count)
        .map(|seq| machine.process(&flat_frame(seq)))
        .collect()
}

fn lost(reason: TrackLostReason) -> Result<MatchResult, TrackLost> {
    Err(TrackLost::from(reason))
}

#[test]
fn test_confident_match_enters_track() {
    let mut m = machine(config(), Scripted::new([hit(0.9)]), Scripted::default());
    let result = m.process(&flat_frame(0));

    assert_eq!(result.state, TrackState::Search);
    assert_eq!(result.next_state, TrackState::Track);
    assert_eq!(result.health, Health::Tracking);
    assert_eq!(result.bounding_region, Some(region()));
    assert_eq!(result.last_good_detection_frame, Some(0));
    assert!(!result.forced);
}

#[test]
fn test_weak_match_stays_in_search() {
    let mut m = machine(config(), Scripted::new([hit(0.4)]), Scripted::default());
    let result = m.process(&flat_frame(0));

    assert_eq!(result.next_state, TrackState::Search);
    assert_eq!(result.health, Health::Searching);
    assert_eq!(result.bounding_region, None);
    assert_eq!(result.last_good_detection_frame, None);
}

#[test]
fn test_end_to_end_lost_then_reacquire() {
    let cfg = config();
    let n = cfg.lost_frame_count as usize;
    let m_frames = cfg.neighborhood_frames as usize;

    let tracker = Scripted::new(
        std::iter::repeat_with(|| hit(0.9))
            .take(4)
            .chain(std::iter::repeat_with(|| hit(0.2)).take(10)),
    );
    let mut m = machine(cfg, Scripted::new([hit(0.9)]), tracker);

    let first = run(&mut m, 0, 5);
    let states: Vec<TrackState> = first.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        [
            TrackState::Search,
            TrackState::Track,
            TrackState::Track,
            TrackState::Track,
            TrackState::Track
        ]
    );

    // Low confidence from frame 5 on: the Nth weak frame gives up.
    let rest = run(&mut m, 5, 30);
    let weak_start = 5;
    let lost_at = rest
        .iter()
        .position(|r| r.next_state == TrackState::Lost)
        .map(|i| i + weak_start)
        .unwrap();
    assert_eq!(lost_at, weak_start + n - 1);
    let r = &rest[lost_at - weak_start];
    assert_eq!(r.consecutive_low_confidence_count as usize, n);
    assert_eq!(r.health, Health::Degraded);

    // M neighborhood frames without a match fall back to a full-frame search.
    let reacquire_at = rest
        .iter()
        .position(|r| r.next_state == TrackState::Reacquire)
        .map(|i| i + weak_start)
        .unwrap();
    assert_eq!(reacquire_at, lost_at + m_frames);
    let after = &rest[reacquire_at - weak_start + 1];
    assert_eq!(after.state, TrackState::Reacquire);
    assert_eq!(after.bounding_region, None);
}

#[test]
fn test_lost_keeps_last_region_and_searches_neighborhood() {
    let detector = Scripted::new([hit(0.9), miss(), hit(0.8)]);
    let scopes = detector.scopes.clone();
    let tracker = Scripted::new([lost(TrackLostReason::WeakResponse)]);
    let mut m = machine(config(), detector, tracker);

    let results = run(&mut m, 0, 4);
    assert_eq!(results[1].state, TrackState::Track);
    assert_eq!(results[1].next_state, TrackState::Lost);
    assert_eq!(results[2].state, TrackState::Lost);
    assert_eq!(results[2].bounding_region, Some(region()));
    // Recovered by the neighborhood match.
    assert_eq!(results[3].next_state, TrackState::Track);
    assert_eq!(results[3].last_good_detection_frame, Some(3));

    let scopes = scopes.lock();
    assert_eq!(scopes[0], SearchScope::FullFrame);
    for scope in &scopes[1..] {
        let SearchScope::Neighborhood(area) = scope else {
            panic!("expected a neighborhood search, got {scope:?}");
        };
        assert!(area.width >= region().width && area.height >= region().height);
        assert!(area.x >= 0.0 && area.y >= 0.0);
        assert!(area.x + area.width <= 160.0 && area.y + area.height <= 120.0);
    }
}

#[test]
fn test_tracker_uses_incremental_scope() {
    let tracker = Scripted::new([hit(0.9), hit(0.9)]);
    let scopes = tracker.scopes.clone();
    let mut m = machine(config(), Scripted::new([hit(0.9)]), tracker);
    run(&mut m, 0, 3);
    assert_eq!(*scopes.lock(), vec![SearchScope::Incremental; 2]);
}

#[test]
fn test_reacquire_times_out_to_search() {
    let cfg = TrackerConfig {
        reacquire_timeout_frames: 3,
        ..config()
    };
    let mut m = machine(cfg, Scripted::default(), Scripted::default());
    m.force_reacquire();

    let results = run(&mut m, 0, 4);
    assert_eq!(results[0].state, TrackState::Reacquire);
    assert_eq!(results[1].state, TrackState::Reacquire);
    assert_eq!(results[2].next_state, TrackState::Search);
    assert_eq!(results[3].state, TrackState::Search);
    assert!(m.session().last_known_region().is_none());
}

#[test]
fn test_reacquire_match_resumes_tracking() {
    let mut m = machine(config(), Scripted::new([miss(), hit(0.7)]), Scripted::default());
    m.force_reacquire();
    let results = run(&mut m, 0, 2);
    assert_eq!(results[0].next_state, TrackState::Reacquire);
    assert_eq!(results[1].next_state, TrackState::Track);
}

/// Drive a machine into `target`; the detector matches only where needed.
fn machine_in(target: TrackState) -> TrackingStateMachine {
    let mut m = match target {
        TrackState::Search => machine(config(), Scripted::default(), Scripted::default()),
        TrackState::Track => machine(
            config(),
            Scripted::new([hit(0.9)]),
            Scripted::new([hit(0.9)]),
        ),
        TrackState::Lost => machine(
            config(),
            Scripted::new([hit(0.9)]),
            Scripted::new([lost(TrackLostReason::OutOfFrame)]),
        ),
        TrackState::Reacquire => {
            let m = machine(config(), Scripted::default(), Scripted::default());
            m.force_reacquire();
            m
        }
    };
    let setup = match target {
        TrackState::Search => 0,
        TrackState::Track => 1,
        TrackState::Lost => 2,
        TrackState::Reacquire => 1,
    };
    run(&mut m, 0, setup);
    assert_eq!(m.state(), target);
    m
}

#[test]
fn test_force_reacquire_from_any_state() {
    for start in [
        TrackState::Search,
        TrackState::Track,
        TrackState::Lost,
        TrackState::Reacquire,
    ] {
        let mut m = machine_in(start);
        m.reacquire_handle().request();
        let result = m.process(&flat_frame(100));

        assert_eq!(result.state, TrackState::Reacquire, "from {start}");
        assert!(result.forced, "from {start}");
        assert_eq!(result.bounding_region, None, "from {start}");
        assert_eq!(result.confidence, 0.0, "from {start}");

        // The request is consumed by a single frame.
        let next = m.process(&flat_frame(101));
        assert!(!next.forced);
    }
}

#[test]
fn test_low_confidence_streak_resets_on_good_frame() {
    let tracker = Scripted::new([hit(0.2), hit(0.2), hit(0.9), hit(0.2)]);
    let mut m = machine(config(), Scripted::new([hit(0.9)]), tracker);
    let results = run(&mut m, 0, 5);
    let counts: Vec<u32> = results[1..]
        .iter()
        .map(|r| r.consecutive_low_confidence_count)
        .collect();
    assert_eq!(counts, [1, 2, 0, 1]);
    assert!(results.iter().skip(1).all(|r| r.next_state == TrackState::Track));
}

#[test]
fn test_periodic_revalidation_refreshes_detection_frame() {
    let cfg = TrackerConfig {
        revalidate_interval: 2,
        ..Default::default()
    };
    let tracker = Scripted::new(std::iter::repeat_with(|| hit(0.9)).take(4));
    let mut m = machine(cfg, Scripted::new([hit(0.9), hit(0.95)]), tracker);

    let results = run(&mut m, 0, 3);
    assert_eq!(results[1].last_good_detection_frame, Some(0));
    assert_eq!(results[2].last_good_detection_frame, Some(2));
    assert_eq!(results[2].next_state, TrackState::Track);
}
