//! Script runtime dispatch semantics: parallel blocks, sync tokens and
//! enqueue-first ordering.

mod common;

use common::MockInstrument;
use instrument_server::plugin::PluginRegistry;
use instrument_server::server::registry::InstrumentRegistry;
use instrument_server::server::Instrument;
use instrument_server::server::runtime::{self, ScriptRuntime};
use instrument_server::server::sync::SyncCoordinator;
use std::sync::Arc;

fn setup(names: &[&str]) -> (Arc<InstrumentRegistry>, Vec<Arc<MockInstrument>>) {
    let coordinator = Arc::new(SyncCoordinator::new());
    let registry = Arc::new(InstrumentRegistry::new(
        Arc::new(PluginRegistry::new()),
        Arc::clone(&coordinator),
    ));
    let mocks: Vec<Arc<MockInstrument>> = names
        .iter()
        .map(|name| {
            let mock = MockInstrument::new(name, Arc::clone(&coordinator));
            registry.insert(mock.clone()).unwrap();
            mock
        })
        .collect();
    (registry, mocks)
}

#[test]
fn parallel_block_tags_all_commands_with_one_token() {
    let (registry, mocks) = setup(&["Inst1", "Inst2"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    runtime::run_script_source(
        &rt,
        r#"
            parallel(|| {
                call("Inst1.Measure");
                call("Inst2.Measure");
            });
        "#,
    )
    .unwrap();

    let first = mocks[0].commands();
    let second = mocks[1].commands();
    assert_eq!(first.len(), 1, "Inst1 must receive exactly one command");
    assert_eq!(second.len(), 1, "Inst2 must receive exactly one command");

    let token = first[0].sync_token.unwrap();
    assert_ne!(token, 0);
    assert_eq!(second[0].sync_token, Some(token));

    assert_eq!(mocks[0].stats().commands_sent, 1);
    assert_eq!(mocks[1].stats().commands_sent, 1);

    // Both participants were released after the barrier completed.
    assert_eq!(mocks[0].continues(), vec![token]);
    assert_eq!(mocks[1].continues(), vec![token]);
}

#[test]
fn uninvolved_instruments_see_no_barrier_traffic() {
    let (registry, mocks) = setup(&["Inst1", "Inst2", "Bystander"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    runtime::run_script_source(
        &rt,
        r#"
            parallel(|| {
                call("Inst1.Measure");
                call("Inst2.Measure");
            });
        "#,
    )
    .unwrap();

    assert!(mocks[2].commands().is_empty());
    assert!(mocks[2].continues().is_empty());
}

#[test]
fn inline_call_returns_the_marshaled_value() {
    let (registry, mocks) = setup(&["DMM1"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    // The mock answers 42.0; feed it back into a second call.
    runtime::run_script_source(
        &rt,
        r#"
            let reading = call("DMM1.MeasureVoltage");
            call("DMM1.SetVoltage", reading * 0.5);
        "#,
    )
    .unwrap();

    let commands = mocks[0].commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[1].params["arg0"],
        instrument_server::ParamValue::F64(21.0)
    );
}

#[test]
fn map_argument_becomes_named_params() {
    let (registry, mocks) = setup(&["DMM1"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    runtime::run_script_source(
        &rt,
        r#"
            call("DMM1.MeasureVoltage", #{ range: 10.0, samples: 100 });
        "#,
    )
    .unwrap();

    let cmd = &mocks[0].commands()[0];
    assert_eq!(cmd.params["range"], instrument_server::ParamValue::F64(10.0));
    assert_eq!(cmd.params["samples"], instrument_server::ParamValue::I64(100));
}

#[test]
fn channel_suffix_adds_channel_param() {
    let (registry, mocks) = setup(&["DAC1"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    runtime::run_script_source(&rt, r#"call("DAC1:3.SetVoltage", 1.25);"#).unwrap();

    let cmd = &mocks[0].commands()[0];
    assert_eq!(cmd.params["channel"], instrument_server::ParamValue::I64(3));
    assert_eq!(cmd.channel_number, Some(3));
}

#[test]
fn enqueue_mode_releases_tokens_in_creation_order() {
    let (registry, mocks) = setup(&["A", "B"]);
    let rt = Arc::new(ScriptRuntime::new(registry, true));

    runtime::run_script_source(
        &rt,
        r#"
            call("A.Setup");
            parallel(|| {
                call("A.Measure");
                call("B.Measure");
            });
            call("B.Teardown");
        "#,
    )
    .unwrap();

    // Enqueue phase dispatched everything already.
    assert_eq!(mocks[0].commands().len(), 2);
    assert_eq!(mocks[1].commands().len(), 2);
    // Nothing released yet.
    assert!(mocks[0].continues().is_empty());

    rt.process_tokens_and_wait();

    // Release order must equal allocation order: A's standalone token, the
    // parallel token (both instruments), then B's standalone token.
    let a_continues = mocks[0].continues();
    let b_continues = mocks[1].continues();
    assert_eq!(a_continues.len(), 2);
    assert_eq!(b_continues.len(), 2);
    assert!(a_continues[0] < a_continues[1]);
    assert!(b_continues[0] < b_continues[1]);
    // The parallel token is shared.
    assert_eq!(a_continues[1], b_continues[0]);

    let results = rt.collect_results_json();
    assert_eq!(results["results"].as_array().unwrap().len(), 4);
    for result in results["results"].as_array().unwrap() {
        assert_eq!(result["success"], true, "unexpected failure: {result}");
    }
}

#[test]
fn missing_instrument_is_reported_not_fatal() {
    let (registry, mocks) = setup(&["Real"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    runtime::run_script_source(
        &rt,
        r#"
            parallel(|| {
                call("Real.Measure");
                call("Ghost.Measure");
            });
        "#,
    )
    .unwrap();

    assert_eq!(mocks[0].commands().len(), 1);
    let results = rt.results();
    assert_eq!(results.len(), 2);
    let ghost = results
        .iter()
        .find(|r| r.instrument_name == "Ghost")
        .unwrap();
    assert!(!ghost.success);
    assert!(ghost.error_message.contains("not found"));
}

#[test]
fn script_errors_surface_as_script_errors() {
    let (registry, _mocks) = setup(&["A"]);
    let rt = Arc::new(ScriptRuntime::new(registry, false));

    let err = runtime::run_script_source(&rt, "this is not rhai ±±±").unwrap_err();
    assert!(matches!(err, instrument_server::ServerError::Script(_)));
}
