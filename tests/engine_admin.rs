mod common;

use std::fs;

use common::{engine_with, settle, test_config};
use kestrel_script_runtime::{
    EngineConfig, ErrorFetch, ItemId, ObjectId, ScriptError, ScriptEvent, ScriptSpec, Severity,
};
use tempfile::tempdir;

const IDLE: &str = "fn default_touch(world) { world.log(\"touch\"); }";

#[test]
fn test_compile_reports_positions_without_loading() {
    let (engine, _world) = engine_with(test_config());
    let broken = engine.test_compile("fn default_touch(world) {\n  let x = ;\n}").expect("compile");
    assert!(!broken.success);
    let error = broken.errors().next().expect("an error diagnostic");
    assert_eq!(error.line, 2);

    let warned = engine.test_compile("fn helper() { 1 }").expect("compile");
    assert!(warned.success);
    assert_eq!(warned.warnings().count(), 1);
    assert_eq!(warned.messages[0].severity, Severity::Warning);
    assert_eq!(engine.stats().scripts, 0);
}

#[test]
fn function_names_follow_the_capability_table() {
    let (engine, _world) = engine_with(test_config());
    let names = engine.function_names();
    assert_eq!(names.first(), Some(&"log"));
    assert!(names.contains(&"set_timer"));
    assert!(names.contains(&"os_message_object"));
}

#[test]
fn compile_reports_are_consumed_or_dropped_with_the_script() {
    let (engine, _world) = engine_with(test_config());
    let object = ObjectId::new();
    let fetched = ItemId::new();
    let unloaded = ItemId::new();
    engine.start_script(ScriptSpec::new(fetched, object, IDLE)).expect("start");
    engine.start_script(ScriptSpec::new(unloaded, object, IDLE)).expect("start");
    settle(&engine);
    assert_eq!(engine.stats().pending_reports, 2);

    assert!(matches!(engine.script_errors(fetched).expect("errors"), ErrorFetch::Succeeded(_)));
    assert_eq!(engine.stats().pending_reports, 1);

    engine.stop_script(unloaded).expect("unload");
    settle(&engine);
    assert_eq!(engine.stats().pending_reports, 0);
}

#[test]
fn stop_all_halts_every_script() {
    let (engine, world) = engine_with(test_config());
    let object = ObjectId::new();
    let items: Vec<ItemId> = (0..3).map(|_| ItemId::new()).collect();
    for item in &items {
        engine.start_script(ScriptSpec::new(*item, object, IDLE)).expect("start");
    }
    settle(&engine);

    assert_eq!(engine.stop_all().expect("stop all"), 3);
    assert_eq!(engine.active_scripts(object).expect("active"), 0);
    assert_eq!(engine.total_scripts(object).expect("total"), 3);
    engine.post_object_event(object, ScriptEvent::new("touch")).expect("post");
    settle(&engine);
    assert!(items.iter().all(|item| world.logs(*item).is_empty()));
    assert_eq!(engine.stats().running, 0);
}

#[test]
fn unknown_scripts_are_not_found() {
    let (engine, _world) = engine_with(test_config());
    let missing = ItemId::new();
    assert!(matches!(engine.reset_script(missing), Err(ScriptError::NotFound(_))));
    assert!(matches!(
        engine.post_event(ObjectId::new(), missing, ScriptEvent::new("touch")),
        Err(ScriptError::NotFound(_))
    ));
    assert!(matches!(engine.capture_state(missing), Err(ScriptError::NotFound(_))));
}

#[test]
fn events_must_name_the_hosting_object() {
    let (engine, _world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, IDLE)).expect("start");
    settle(&engine);
    assert!(matches!(
        engine.post_event(ObjectId::new(), item, ScriptEvent::new("touch")),
        Err(ScriptError::NotFound(_))
    ));
}

#[test]
fn operations_after_shutdown_fail() {
    let (engine, _world) = engine_with(test_config());
    let object = ObjectId::new();
    let item = ItemId::new();
    engine.start_script(ScriptSpec::new(item, object, IDLE)).expect("start");
    settle(&engine);

    engine.shutdown();
    engine.shutdown();
    assert!(matches!(engine.start_script(ScriptSpec::new(ItemId::new(), object, IDLE)), Err(ScriptError::ShutDown)));
    assert!(matches!(engine.post_event(object, item, ScriptEvent::new("touch")), Err(ScriptError::ShutDown)));
    assert!(matches!(engine.stop_script(item), Err(ScriptError::ShutDown)));
    assert_eq!(engine.stats().execution.workers, 0);
}

#[test]
fn zero_sized_domains_are_rejected() {
    let mut config = test_config();
    config.domain_capacity = 0;
    let result = kestrel_script_runtime::ScriptEngine::new(config, Default::default());
    assert!(matches!(result, Err(ScriptError::Config(_))));
}

#[test]
fn config_file_drives_worker_and_domain_sizes() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("scripts.json");
    fs::write(&path, r#"{ "execution_workers": 2, "maintenance_workers": 1, "domain_capacity": 3 }"#)
        .expect("write config");
    let config = EngineConfig::load(&path).expect("load config");
    let (engine, _world) = engine_with(config);

    let stats = engine.stats();
    assert_eq!(stats.execution.workers, 2);
    assert_eq!(stats.maintenance.workers, 1);
    assert_eq!(engine.config().domain_capacity, 3);
    assert_eq!(engine.config().max_domains, 256);
}
