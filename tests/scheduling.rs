mod common;

use std::time::{Duration, Instant};

use common::{engine_with, int_local, settle, test_config};
use kestrel_script_runtime::{ItemId, ObjectId, ScriptEvent, ScriptSpec};

const COUNTER: &str = r#"
    fn globals() { #{ count: 0, seen: [] } }
    fn default_state_entry(world) { world.log("ready"); }
    fn default_touch(world, n) {
        let spin = 0;
        for i in 0..500 { spin += i; }
        this.count += 1;
        this.seen.push(n);
        world.log("touch:" + n);
    }
"#;

fn touches(lines: &[String]) -> Vec<String> {
    lines.iter().filter(|line| line.starts_with("touch:")).cloned().collect()
}

#[test]
fn events_for_one_script_run_in_order_and_never_overlap() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, COUNTER)).expect("start");
    settle(&engine);

    for n in 0..40_i64 {
        assert!(engine.post_event(object, item, ScriptEvent::new("touch").with_arg(n)).expect("post"));
    }
    settle(&engine);

    let expected: Vec<String> = (0..40).map(|n| format!("touch:{n}")).collect();
    assert_eq!(touches(&world.logs(item)), expected);
    // Overlapping runs would each start from an emptied locals map and lose increments.
    assert_eq!(int_local(&engine, item, "count"), 40);
    let seen = engine.locals(item).expect("locals").get("seen").cloned().expect("seen").into_array().expect("array");
    assert_eq!(seen.len(), 40);
}

#[test]
fn different_scripts_interleave_but_each_keeps_its_order() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let items: Vec<ItemId> = (0..4).map(|_| ItemId::new()).collect();
    for item in &items {
        engine.start_script(ScriptSpec::new(*item, object, COUNTER)).expect("start");
    }
    settle(&engine);

    for n in 0..10_i64 {
        assert_eq!(engine.post_object_event(object, ScriptEvent::new("touch").with_arg(n)).expect("post"), 4);
    }
    settle(&engine);

    let expected: Vec<String> = (0..10).map(|n| format!("touch:{n}")).collect();
    for item in items {
        assert_eq!(touches(&world.logs(item)), expected, "script {item} saw events out of order");
    }
}

#[test]
fn disabled_engine_keeps_events_until_enabled() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let items: Vec<ItemId> = (0..5).map(|_| ItemId::new()).collect();
    for item in &items {
        engine.start_script(ScriptSpec::new(*item, object, COUNTER)).expect("start");
    }
    settle(&engine);

    engine.disable().expect("disable");
    assert!(!engine.is_enabled());
    for n in 0..20_i64 {
        for item in &items {
            engine.post_event(object, *item, ScriptEvent::new("touch").with_arg(n)).expect("post");
        }
    }
    settle(&engine);
    assert!(items.iter().all(|item| touches(&world.logs(*item)).is_empty()), "nothing may dispatch while disabled");
    assert_eq!(engine.stats().queue.events, 100);
    assert_eq!(engine.stats().scripts, 5, "disabling destroys nothing");

    engine.enable().expect("enable");
    settle(&engine);
    let expected: Vec<String> = (0..20).map(|n| format!("touch:{n}")).collect();
    for item in &items {
        assert_eq!(touches(&world.logs(*item)), expected, "no event lost or duplicated for {item}");
        assert_eq!(int_local(&engine, *item, "count"), 20);
    }
    assert_eq!(engine.stats().queue.events, 0);
}

#[test]
fn suspended_scripts_hold_events_until_resumed() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, COUNTER)).expect("start");
    settle(&engine);

    engine.suspend(item).expect("suspend");
    for n in 0..3_i64 {
        engine.post_event(object, item, ScriptEvent::new("touch").with_arg(n)).expect("post");
    }
    settle(&engine);
    assert!(touches(&world.logs(item)).is_empty());
    assert!(engine.summary(item).expect("summary").suspended);

    engine.resume(item).expect("resume");
    settle(&engine);
    assert_eq!(touches(&world.logs(item)), vec!["touch:0", "touch:1", "touch:2"]);
}

#[test]
fn toggling_suspend_while_dispatching_never_strands_events() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, COUNTER)).expect("start");
    settle(&engine);

    for n in 0..200_i64 {
        engine.post_event(object, item, ScriptEvent::new("touch").with_arg(n)).expect("post");
        engine.suspend(item).expect("suspend");
        engine.resume(item).expect("resume");
    }
    settle(&engine);
    assert!(!engine.summary(item).expect("summary").suspended);
    assert_eq!(engine.stats().queue.events, 0, "a resumed script must not keep held events");
    let expected: Vec<String> = (0..200).map(|n| format!("touch:{n}")).collect();
    assert_eq!(touches(&world.logs(item)), expected);
}

#[test]
fn locals_are_never_observed_mid_handler() {
    let (engine, _world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    let source = r#"
        fn globals() { #{ count: 0 } }
        fn default_touch(world) {
            this.count += 1;
            let spin = 0;
            for i in 0..20000 { spin += i; }
        }
    "#;
    engine.start_script(ScriptSpec::new(item, object, source)).expect("start");
    settle(&engine);

    for _ in 0..5 {
        engine.post_event(object, item, ScriptEvent::new("touch")).expect("post");
    }
    for _ in 0..20 {
        assert!(engine.locals(item).expect("locals").contains_key("count"));
    }
    settle(&engine);
    assert_eq!(int_local(&engine, item, "count"), 5);
}

#[test]
fn stopped_scripts_queue_events_and_keep_state() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, COUNTER)).expect("start");
    settle(&engine);
    engine.post_event(object, item, ScriptEvent::new("touch").with_arg(1_i64)).expect("post");
    settle(&engine);

    engine.set_running(item, false).expect("stop");
    assert!(!engine.is_running(item).expect("running"));
    assert_eq!(engine.active_scripts(object).expect("active"), 0);
    engine.post_event(object, item, ScriptEvent::new("touch").with_arg(2_i64)).expect("post");
    settle(&engine);
    assert_eq!(touches(&world.logs(item)).len(), 1);
    assert_eq!(int_local(&engine, item, "count"), 1);

    engine.set_running(item, true).expect("start again");
    settle(&engine);
    assert_eq!(touches(&world.logs(item)), vec!["touch:1", "touch:2"]);
    assert_eq!(int_local(&engine, item, "count"), 2);
}

#[test]
fn min_event_delay_spaces_out_dispatches() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, COUNTER)).expect("start");
    settle(&engine);

    engine.set_min_event_delay(item, 0.05).expect("delay");
    let started = Instant::now();
    for n in 0..4_i64 {
        engine.post_event(object, item, ScriptEvent::new("touch").with_arg(n)).expect("post");
    }
    settle(&engine);
    assert_eq!(touches(&world.logs(item)).len(), 4);
    assert!(started.elapsed() >= Duration::from_millis(150), "three gaps of 50ms expected");
}

#[test]
fn dispatched_events_are_counted_and_ranked() {
    let (engine, _world) = engine_with(test_config());
    let object = ObjectId::new();
    let busy = ItemId::new();
    let quiet = ItemId::new();
    engine.start_script(ScriptSpec::new(busy, object, COUNTER)).expect("start");
    engine.start_script(ScriptSpec::new(quiet, object, "fn default_touch(world, n) { }")).expect("start");
    settle(&engine);
    engine.take_event_count();

    for n in 0..5_i64 {
        engine.post_event(object, busy, ScriptEvent::new("touch").with_arg(n)).expect("post");
    }
    settle(&engine);
    assert_eq!(engine.take_event_count(), 5);
    assert_eq!(engine.take_event_count(), 0);

    let top = engine.top_scripts(1);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].item, busy);

    let stats = engine.stats();
    assert_eq!(stats.scripts, 2);
    assert_eq!(stats.running, 2);
    assert_eq!(stats.execution.workers, 4);
    assert_eq!(stats.maintenance.workers, 2);
    assert!(stats.dispatched >= 5);
}
