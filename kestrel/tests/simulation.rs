use hifitime::TimeUnits;
use kestrel::*;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod util;
use util::*;

fn fresh(model: &Rover, schedule: &Schedule, plan_duration: Duration) -> Result<SimulationResultsInputs> {
    Ok(run(
        model,
        schedule,
        plan_duration,
        CachedSimulationEngine::empty(model, plan_start())?,
        &Correspondence::new(),
        no_condition(),
        once_all_activities_are_finished(),
        &mut InMemoryCachedEngineStore::new(0),
    )?)
}

#[test]
fn end_anchors_wait_for_their_target() -> Result<()> {
    let model = Rover::default();
    let schedule = Schedule::from([
        (id(1), at(1.seconds(), wait(5))),
        (id(2), at(2.seconds(), wait(1)).anchored_to(id(1), false)),
        (id(3), at(-1.seconds(), wait(1)).anchored_to(id(2), true)),
    ]);
    let results = fresh(&model, &schedule, 1.minutes())?;

    assert_eq!(SimulationOutcome::Stopped, results.outcome);
    let start = |n| results.span_of(id(n)).map(|span| span.start);
    assert_eq!(Some(1.seconds()), start(1));
    assert_eq!(Some(8.seconds()), start(2));
    assert_eq!(Some(7.seconds()), start(3));
    assert_eq!(9.seconds(), results.elapsed);
    Ok(())
}

#[test]
fn directive_markers_are_on_the_timeline() -> Result<()> {
    let model = Rover::default();
    let schedule = Schedule::from([(id(4), at(3.seconds(), wait(1)))]);
    let results = fresh(&model, &schedule, 1.minutes())?;

    let markers: Vec<(Duration, Effect)> = results
        .engine()
        .timeline()
        .events()
        .filter(|(_, event)| event.topic == Topic::DIRECTIVE_MARKERS)
        .map(|(time, event)| (time, event.effect.clone()))
        .collect();
    assert_eq!(vec![(3.seconds(), Effect::Marker(id(4)))], markers);
    Ok(())
}

#[test]
fn failures_are_attributed_to_their_directive() -> Result<()> {
    let model = Rover::default();
    let explode = SerializedActivity::without_arguments("Explode");
    let schedule = Schedule::from([
        (id(1), at(0.seconds(), wait(10))),
        (id(2), at(3.seconds(), explode)),
    ]);
    let Err(error) = fresh(&model, &schedule, 1.minutes()) else {
        bail!("the explosion should fail the simulation");
    };
    let Some(SimulationError::Simulation {
        elapsed,
        instant,
        directive,
        trail,
        cause,
    }) = error.downcast_ref::<SimulationError>()
    else {
        bail!("unexpected error: {error}");
    };
    assert_eq!(4.seconds(), *elapsed);
    assert_eq!(plan_start() + 4.seconds(), *instant);
    assert_eq!(Some(id(2)), *directive);
    assert_eq!(&vec!["Explode".to_string()], trail);
    assert_eq!("kaboom", cause.to_string());
    Ok(())
}

#[test]
fn child_failures_carry_the_whole_trail() -> Result<()> {
    let model = Rover::default();
    let survey = SerializedActivity::without_arguments("Survey");
    let schedule = Schedule::from([(id(7), at(0.seconds(), survey))]);
    let Err(error) = fresh(&model, &schedule, 1.minutes()) else {
        bail!("the drill should jam");
    };
    let Some(SimulationError::Simulation {
        elapsed,
        directive,
        trail,
        ..
    }) = error.downcast_ref::<SimulationError>()
    else {
        bail!("unexpected error: {error}");
    };
    assert_eq!(2.seconds(), *elapsed);
    assert_eq!(Some(id(7)), *directive);
    assert_eq!(&vec!["Survey".to_string(), "Sample".to_string()], trail);
    Ok(())
}

#[test]
fn unknown_activities_fail_before_simulating() -> Result<()> {
    let model = Rover::default();
    let schedule = Schedule::from([(
        id(3),
        at(0.seconds(), SerializedActivity::without_arguments("Teleport")),
    )]);
    let Err(error) = fresh(&model, &schedule, 1.minutes()) else {
        bail!("nobody knows how to teleport");
    };
    match error.downcast_ref::<SimulationError>() {
        Some(SimulationError::ActivityInstantiation {
            directive,
            type_name,
            ..
        }) => {
            assert_eq!(id(3), *directive);
            assert_eq!("Teleport", type_name);
        }
        _ => bail!("unexpected error: {error}"),
    }
    Ok(())
}

#[test]
fn broken_anchors_are_rejected() -> Result<()> {
    let model = Rover::default();
    let cyclic = Schedule::from([
        (id(1), at(0.seconds(), wait(1)).anchored_to(id(2), true)),
        (id(2), at(0.seconds(), wait(1)).anchored_to(id(1), false)),
    ]);
    let error = fresh(&model, &cyclic, 1.minutes()).err().ok_or(anyhow!("cycle accepted"))?;
    assert!(matches!(
        error.downcast_ref::<SimulationError>(),
        Some(SimulationError::AnchorCycle { .. })
    ));

    let dangling = Schedule::from([(id(1), at(0.seconds(), wait(1)).anchored_to(id(9), true))]);
    let error = fresh(&model, &dangling, 1.minutes()).err().ok_or(anyhow!("dangling anchor accepted"))?;
    assert!(matches!(
        error.downcast_ref::<SimulationError>(),
        Some(SimulationError::MissingAnchor { directive, anchor }) if *directive == id(1) && *anchor == id(9)
    ));
    Ok(())
}

#[test]
fn resumed_runs_schedule_each_dependent_once() -> Result<()> {
    let model = Rover::default();
    let schedule = Schedule::from([
        (id(1), at(0.seconds(), drive(10, 1.0))),
        (id(2), at(1.seconds(), wait(1)).anchored_to(id(1), false)),
        (id(3), at(20.seconds(), wait(1))),
    ]);
    let mut store = InMemoryCachedEngineStore::new(4);
    run(
        &model,
        &schedule,
        1.minutes(),
        CachedSimulationEngine::empty(&model, plan_start())?,
        &Correspondence::new(),
        desired_checkpoints([5.seconds()]),
        once_all_activities_are_finished(),
        &mut store,
    )?;
    assert_eq!(3, model.instantiations());

    let mut edited = schedule.clone();
    edited.insert(id(3), at(25.seconds(), wait(1)));
    let (cached, correspondence) =
        best_cached_engine(&edited, &store.cached_engines(&configuration()), 1.minutes())
            .ok_or(anyhow!("the early snapshot should be reusable"))?;
    assert_eq!(0.seconds(), cached.ends_at());

    let resumed = run(
        &model,
        &edited,
        1.minutes(),
        cached,
        &correspondence,
        no_condition(),
        once_all_activities_are_finished(),
        &mut store,
    )?;
    // Directive 1 was already running in the snapshot; only 2 and 3 are new.
    assert_eq!(5, model.instantiations());
    assert_eq!(SimulationOutcome::Stopped, resumed.outcome);
    assert_eq!(26.seconds(), resumed.elapsed);
    assert_eq!(Some(11.seconds()), resumed.span_of(id(2)).map(|span| span.start));
    assert_eq!(
        starts(&resumed.profile("odometer")?),
        vec![(0.seconds(), 0.0), (10.seconds(), 1.0)]
    );
    Ok(())
}

#[test]
fn resources_wait_for_their_topics() -> Result<()> {
    let model = Rover {
        heartbeat: Some(1.seconds()),
        ..Rover::default()
    };
    let schedule = Schedule::from([(id(1), at(50.seconds(), drive(2, 3.0)))]);
    let results = run(
        &model,
        &schedule,
        100.seconds(),
        CachedSimulationEngine::empty(&model, plan_start())?,
        &Correspondence::new(),
        no_condition(),
        no_condition(),
        &mut InMemoryCachedEngineStore::new(0),
    )?;

    assert_eq!(SimulationOutcome::Exhausted, results.outcome);
    assert_eq!(100.seconds(), results.elapsed);
    // Once each at the start, mode when driving starts, and both when it ends.
    assert_eq!(5, results.snapshot.tracker().recomputations());
    assert_eq!(
        starts(&results.profile("odometer")?),
        vec![(0.seconds(), 0.0), (52.seconds(), 3.0)]
    );
    let mode: Vec<Value> = results
        .profile("mode")?
        .into_iter()
        .map(|segment| segment.value)
        .collect();
    assert_eq!(
        vec![
            Value::Text("idle".into()),
            Value::Text("driving".into()),
            Value::Text("idle".into())
        ],
        mode
    );
    Ok(())
}

#[test]
fn cancellation_stops_between_batches() -> Result<()> {
    let model = Rover {
        heartbeat: Some(1.seconds()),
        ..Rover::default()
    };
    let schedule = Schedule::from([(id(1), at(10.seconds(), wait(1)))]);
    let canceled = AtomicBool::new(false);
    let settings = OrchestratorSettings::default();
    let mut seen = vec![];
    let results = Simulation {
        mission_model: &model,
        schedule: &schedule,
        simulation_start: plan_start(),
        simulation_duration: 1.minutes(),
        plan_start: plan_start(),
        plan_duration: 1.minutes(),
        settings: &settings,
        canceled: &canceled,
    }
    .simulate_with_checkpoints(
        CachedSimulationEngine::empty(&model, plan_start())?,
        &Correspondence::new(),
        no_condition(),
        once_all_activities_are_finished(),
        &mut InMemoryCachedEngineStore::new(2),
        &configuration(),
        &mut |elapsed| {
            seen.push(elapsed);
            if elapsed >= 5.seconds() {
                canceled.store(true, Ordering::Relaxed);
            }
        },
    )?;

    assert_eq!(SimulationOutcome::Canceled, results.outcome);
    assert_eq!(5.seconds(), results.elapsed);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(Some(&5.seconds()), seen.last());
    // Scheduled, but never started.
    assert_eq!(None, results.span_of(id(1)).and_then(|span| span.end));
    assert!(!results.engine().timeline().events().any(|(_, event)| event.effect == Effect::Marker(id(1))));
    Ok(())
}

#[test]
fn speculative_continuations_share_a_store() -> Result<()> {
    let model = Rover::default();
    let base: Schedule = (0..6u64)
        .map(|n| (id(n), at((n as i64 * 10).seconds(), drive(5, 1.0))))
        .collect();
    let shared = Arc::new(Mutex::new(InMemoryCachedEngineStore::new(16)));
    run(
        &model,
        &base,
        2.minutes(),
        CachedSimulationEngine::empty(&model, plan_start())?,
        &Correspondence::new(),
        spread_checkpoints(6, Duration::ZERO, 1.minutes()),
        once_all_activities_are_finished(),
        &mut shared.clone(),
    )?;
    assert!(shared.lock().len() > 1);

    let variants: Vec<Schedule> = (0..6u64)
        .map(|n| {
            let mut variant = base.clone();
            variant.insert(id(n), at((n as i64 * 10 + 3).seconds(), drive(5, 2.0)));
            variant
        })
        .collect();

    let outcomes: Vec<Result<(Vec<Segment>, Vec<Segment>)>> = variants
        .par_iter()
        .map(|variant| {
            let mut store = shared.clone();
            let candidates = store.cached_engines(&configuration());
            let (cached, correspondence) =
                match best_cached_engine(variant, &candidates, 2.minutes()) {
                    Some(found) => found,
                    None => (CachedSimulationEngine::empty(&model, plan_start())?, Correspondence::new()),
                };
            drop(candidates);
            let reused = run(
                &model,
                variant,
                2.minutes(),
                cached,
                &correspondence,
                no_condition(),
                once_all_activities_are_finished(),
                &mut store,
            )?;
            let straight = fresh(&model, variant, 2.minutes())?;
            Ok((reused.profile("odometer")?, straight.profile("odometer")?))
        })
        .collect();

    for outcome in outcomes {
        let (reused, straight) = outcome?;
        assert_eq!(straight, reused);
    }
    Ok(())
}
