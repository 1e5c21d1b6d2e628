//! End-to-end engine tests over an in-process bus

use mq_bus::{Bus, MemoryBus};
use mq_core::Scalar;
use mq_exe::ExeService;
use mq_store::{Store, SCRIPT_MIGRATIONS};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Engine {
    bus: Arc<MemoryBus>,
    store: Arc<Store>,
    service: Arc<ExeService>,
}

impl Engine {
    fn new(scripts: &[(&str, &str)]) -> Self {
        let store = Store::open_in_memory().unwrap();
        store.migrate(SCRIPT_MIGRATIONS).unwrap();
        for (name, body) in scripts {
            store.put_script(name, body).unwrap();
        }
        let store = Arc::new(store);

        let bus = MemoryBus::new();
        let service = ExeService::new(bus.clone(), Arc::clone(&store)).unwrap();
        let handler = Arc::clone(&service);
        bus.start(Box::new(move |topic, payload| {
            handler.handle_message(topic, payload)
        }))
        .unwrap();

        Self { bus, store, service }
    }

    fn global(&self, name: &str) -> Option<Scalar> {
        self.service.globals().get(name)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.service.shutdown();
        self.bus.close();
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// Waiting on values and deadlines
// ============================================================================

#[test]
fn test_wait_and_value_with_deadline() {
    let engine = Engine::new(&[(
        "door",
        r#"
local door = register_value("A/B:Door")
wait_and(door, "NOW 2 second")
set_global("woke", true)
"#,
    )]);
    let started = Instant::now();
    assert_eq!(engine.service.start_all().unwrap(), 1);
    assert!(wait_until(Duration::from_secs(1), || engine.service.broker().value_entries() == 1));

    thread::sleep(Duration::from_secs(1).saturating_sub(started.elapsed()));
    engine.bus.publish("status/A/B", r#"{"Door":true}"#).unwrap();
    engine.bus.flush().unwrap();

    // The value fired, the deadline has not
    thread::sleep(Duration::from_millis(500));
    assert_eq!(engine.global("woke"), None);

    assert!(wait_until(Duration::from_secs(3), || engine.global("woke").is_some()));
    let woke_after = started.elapsed();
    assert!(woke_after >= Duration::from_secs(2), "woke early: {woke_after:?}");
    assert!(woke_after < Duration::from_secs(3), "woke late: {woke_after:?}");
}

#[test]
fn test_value_update_drives_script() {
    let engine = Engine::new(&[(
        "heating",
        r#"
local temp = register_value("room:T")
while true do
  wait_or(temp)
  local t = request_value(temp)
  write_value("room/heater:On", t < 20)
end
"#,
    )]);
    engine.service.start_all().unwrap();
    assert!(engine.bus.subscriptions().contains(&"status/room".to_string()));
    assert!(wait_until(Duration::from_secs(1), || engine.service.broker().value_entries() == 1));

    engine.bus.publish("status/room", r#"{"T":[18.5,"°C"]}"#).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        engine.bus.published_on("set/room/heater") == vec![r#"{"On":true}"#.to_string()]
    }));
    assert_eq!(
        engine.service.cache().get(&"room:T".parse().unwrap()),
        Some(Scalar::Float(18.5))
    );
}

#[test]
fn test_rejected_scripts_do_not_start() {
    let engine = Engine::new(&[
        ("bad_ref", r#"register_value("nope")"#),
        ("bad_syntax", "this is not lua"),
        ("good", r#"set_global("good_ran", true)"#),
    ]);
    assert_eq!(engine.service.start_all().unwrap(), 1);
    assert!(wait_until(Duration::from_secs(1), || engine.global("good_ran").is_some()));
}

// ============================================================================
// Reload
// ============================================================================

#[test]
fn test_reload_restarts_scripts_with_new_bodies() {
    let body = |script: &str, generation: i32| {
        format!(
            r#"
set_global("{script}", {generation})
local tick = register_value("clock:Tick")
while true do
  wait_or(tick, "NOW 1 hour")
end
"#
        )
    };
    let (a, b) = (body("a", 1), body("b", 1));
    let engine = Engine::new(&[("a", a.as_str()), ("b", b.as_str())]);
    engine.service.start_all().unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        engine.service.broker().value_entries() == 2
    }));
    assert_eq!(engine.global("a"), Some(Scalar::Int(1)));

    engine.store.put_script("a", &body("a", 2)).unwrap();
    engine.store.put_script("b", &body("b", 2)).unwrap();
    engine.bus.publish("app/exe/reload", "").unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        engine.global("a") == Some(Scalar::Int(2)) && engine.global("b") == Some(Scalar::Int(2))
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        let mut running = engine.service.running();
        running.sort();
        running == ["a", "b"]
    }));
}

#[test]
fn test_concurrent_reloads_are_serialised() {
    let engine = Engine::new(&[(
        "idle",
        r#"
local v = register_value("x:V")
while true do wait_or(v) end
"#,
    )]);
    engine.service.start_all().unwrap();

    let handles: Vec<_> = (0..5)
        .filter_map(|_| engine.service.request_reload())
        .collect();
    assert!(!handles.is_empty());
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(1), || {
        engine.service.broker().value_entries() == 1
    }));
    assert!(wait_until(Duration::from_secs(1), || engine.service.running() == ["idle"]));
}

#[test]
fn test_stop_all_joins_and_unsubscribes() {
    let engine = Engine::new(&[(
        "waiter",
        r#"
wait_and(register_value("x:A"), register_value("x:B"))
"#,
    )]);
    engine.service.start_all().unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        engine.service.broker().value_entries() == 2
    }));

    engine.service.stop_all();
    assert!(engine.service.running().is_empty());
    assert!(engine.bus.subscriptions().is_empty());
    assert_eq!(engine.service.broker().value_entries(), 0);
    assert!(!engine.service.broker().is_aborting());
}

#[test]
fn test_reload_during_startup_keeps_one_generation() {
    const SCRIPTS: usize = 40;
    let body = r#"
local v = register_value("x:V")
while true do wait_or(v) end
"#;
    let names: Vec<String> = (0..SCRIPTS).map(|i| format!("s{i:02}")).collect();
    let scripts: Vec<(&str, &str)> = names.iter().map(|name| (name.as_str(), body)).collect();
    let engine = Arc::new(Engine::new(&scripts));

    let starter = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.service.start_all().unwrap())
    };
    thread::sleep(Duration::from_millis(2));
    engine.bus.publish("app/exe/reload", "").unwrap();
    assert_eq!(starter.join().unwrap(), SCRIPTS);

    // Watch the startup and the reload that follows it
    let started = Instant::now();
    let mut most = 0;
    while started.elapsed() < Duration::from_secs(2) {
        most = most.max(engine.service.broker().value_entries());
        thread::sleep(Duration::from_millis(2));
    }
    assert!(most <= SCRIPTS, "{most} waits for {SCRIPTS} scripts");
    assert!(wait_until(Duration::from_secs(2), || {
        engine.service.broker().value_entries() == SCRIPTS
    }));
    assert_eq!(engine.service.running().len(), SCRIPTS);
}

#[test]
fn test_reload_after_shutdown_is_ignored() {
    let engine = Engine::new(&[(
        "idle",
        r#"
local v = register_value("x:V")
while true do wait_or(v) end
"#,
    )]);
    engine.service.start_all().unwrap();
    engine.service.shutdown();

    if let Some(handle) = engine.service.request_reload() {
        handle.join().unwrap();
    }
    assert!(engine.service.running().is_empty());
    assert!(engine.bus.subscriptions().is_empty());
}
