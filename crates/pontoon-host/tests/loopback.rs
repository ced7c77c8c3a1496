//! Full-bridge loopback tests: a real client talking to a real server over
//! Unix sockets and shared memory, with passthrough objects on the far
//! side. The server runs in-process for most tests; the process-death test
//! spawns the actual `pontoon-host` binary and kills it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use pontoon_bridge::protocol::{
    AudioBusBuffer, BridgeConfig, BusDirection, Capability, ChannelKind, ContextMenuHandle,
    MediaType, ObjectHandle, ParameterChanges, ProcessBlock, ProcessMode, ProcessSetup,
    SampleWidth,
};
use pontoon_bridge::{BridgeClient, BridgeError, HostCallbackHandler, HostContextMenu};
use pontoon_host::passthrough::{
    GENERIC_CLOSE_MENU, GENERIC_EDIT_GESTURE, GENERIC_OPEN_MENU, GENERIC_REQUEST_DEFERRED,
    GENERIC_SELECTED_TAGS,
};
use pontoon_host::HostServer;

// ----------------------------------------------------------------------------
// Test host plumbing
// ----------------------------------------------------------------------------

/// Parks the popup until the test releases it, so a test can hold the main
/// channel open at a known point.
struct PopupGate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

struct TestMenu {
    items: Arc<Mutex<Vec<(i32, String)>>>,
    popups: Arc<AtomicUsize>,
    gate: Arc<Mutex<Option<PopupGate>>>,
    action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl HostContextMenu for TestMenu {
    fn add_item(&mut self, tag: i32, name: &str) {
        self.items.lock().push((tag, name.to_string()));
    }
    fn popup(&mut self, _x: i32, _y: i32) -> bool {
        self.popups.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.gate.lock().take() {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        // A modal menu fires its selection before popup returns.
        if let Some(action) = self.action.lock().take() {
            action();
        }
        true
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
    deferred: Mutex<Option<mpsc::Sender<ObjectHandle>>>,
    menu_items: Arc<Mutex<Vec<(i32, String)>>>,
    menu_popups: Arc<AtomicUsize>,
    popup_gate: Arc<Mutex<Option<PopupGate>>>,
    popup_action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl HostCallbackHandler for RecordingHandler {
    fn restart_component(&self, _object: ObjectHandle, flags: u32) {
        self.events.lock().push(format!("restart:{flags}"));
    }
    fn parameter_values_changed(&self, _object: ObjectHandle) {
        self.events.lock().push("params_changed".to_string());
    }
    fn begin_edit(&self, _object: ObjectHandle, parameter_id: u32) {
        self.events.lock().push(format!("begin_edit:{parameter_id}"));
    }
    fn perform_edit(&self, _object: ObjectHandle, parameter_id: u32, value: f64) {
        self.events
            .lock()
            .push(format!("perform_edit:{parameter_id}:{value}"));
    }
    fn end_edit(&self, _object: ObjectHandle, parameter_id: u32) {
        self.events.lock().push(format!("end_edit:{parameter_id}"));
    }
    fn deferred_callback(&self, object: ObjectHandle) {
        self.events.lock().push("deferred".to_string());
        if let Some(tx) = self.deferred.lock().as_ref() {
            let _ = tx.send(object);
        }
    }
    fn create_context_menu(
        &self,
        _object: ObjectHandle,
        _parameter_id: Option<u32>,
    ) -> Option<Box<dyn HostContextMenu>> {
        Some(Box::new(TestMenu {
            items: self.menu_items.clone(),
            popups: self.menu_popups.clone(),
            gate: self.popup_gate.clone(),
            action: self.popup_action.clone(),
        }))
    }
}

struct Instance {
    client: BridgeClient,
    handler: Arc<RecordingHandler>,
    // Keeps the socket directory alive for the whole test.
    _dir: tempfile::TempDir,
}

fn start_instance(tag: &str) -> Instance {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        socket_path: dir.path().join("bridge.sock"),
        shm_prefix: format!("pontoon-loopback-{tag}-{}", std::process::id()),
        timeout_ms: 10_000,
        event_loop_tick_ms: 1,
    };
    let server = HostServer::with_passthrough(config.clone());
    thread::spawn(move || {
        if let Err(e) = server.run(|| {}) {
            eprintln!("server exited with error: {e}");
        }
    });

    let handler = Arc::new(RecordingHandler::default());
    let (client, event_loop) = BridgeClient::connect(config, handler.clone()).unwrap();
    thread::spawn(move || event_loop.run(|| {}));
    Instance {
        client,
        handler,
        _dir: dir,
    }
}

fn stereo_block(num_samples: u32, fill: f32) -> ProcessBlock {
    ProcessBlock {
        mode: ProcessMode::Realtime,
        width: SampleWidth::F32,
        num_samples,
        inputs: vec![AudioBusBuffer::from_f32(
            vec![
                vec![fill; num_samples as usize],
                vec![-fill; num_samples as usize],
            ],
            0,
        )],
        output_channel_counts: vec![2],
        parameter_changes: ParameterChanges::default(),
        events: None,
        context: None,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[test]
fn test_create_and_query_object() {
    let instance = start_instance("query");
    let proxy = instance.client.create_object().unwrap();

    assert_eq!(proxy.handle(), ObjectHandle(1));
    assert!(proxy.capabilities().contains(Capability::AudioProcessor));
    assert!(proxy.supports(Capability::EditController).unwrap());
    assert!(!proxy.supports(Capability::MidiLearn).unwrap());

    assert_eq!(
        proxy.bus_count(MediaType::Audio, BusDirection::Input).unwrap(),
        1
    );
    assert_eq!(
        proxy.bus_count(MediaType::Event, BusDirection::Output).unwrap(),
        0
    );
    let info = proxy
        .bus_info(MediaType::Audio, BusDirection::Output, 0)
        .unwrap()
        .unwrap();
    assert_eq!(info.channel_count, 2);
    assert_eq!(info.name, "Stereo Out");
    assert_eq!(
        proxy.bus_info(MediaType::Audio, BusDirection::Output, 3).unwrap(),
        None
    );

    assert_eq!(proxy.parameter_count().unwrap(), 2);
    assert_eq!(proxy.parameter_info(0).unwrap().unwrap().id, 100);
    assert!(proxy.parameter_info(1).unwrap().unwrap().is_bypass);
    assert_eq!(proxy.parameter_info(7).unwrap(), None);

    assert!(proxy.can_process_sample_size(SampleWidth::F32).unwrap());
    assert!(!proxy.can_process_sample_size(SampleWidth::F64).unwrap());
}

#[test]
fn test_process_passthrough_and_region_growth() {
    let instance = start_instance("process");
    let proxy = instance.client.create_object().unwrap();

    proxy
        .setup_processing(ProcessSetup {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            max_block_samples: 512,
            sample_rate: 48_000.0,
        })
        .unwrap();
    proxy.set_processing(true).unwrap();

    // Small block round trip.
    let small = stereo_block(64, 0.25);
    let result = proxy.process(&small).unwrap();
    assert_eq!(result.outputs, small.inputs);

    // A block too big for the initial region forces a growth and a remap on
    // the remote side, mid-stream.
    let ramp: Vec<f32> = (0..16_384).map(|i| (i % 101) as f32 / 100.0).collect();
    let big = ProcessBlock {
        mode: ProcessMode::Realtime,
        width: SampleWidth::F32,
        num_samples: 16_384,
        inputs: vec![AudioBusBuffer::from_f32(
            vec![ramp.clone(); 8],
            0,
        )],
        output_channel_counts: vec![8],
        parameter_changes: ParameterChanges::default(),
        events: None,
        context: None,
    };
    let result = proxy.process(&big).unwrap();
    assert_eq!(result.outputs, big.inputs);

    // And the stream keeps going at the new generation.
    let after = stereo_block(64, 0.5);
    let result = proxy.process(&after).unwrap();
    assert_eq!(result.outputs, after.inputs);

    proxy.set_processing(false).unwrap();
}

#[test]
fn test_oversized_block_rejected_without_round_trip() {
    let instance = start_instance("limits");
    let proxy = instance.client.create_object().unwrap();
    proxy
        .setup_processing(ProcessSetup {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            max_block_samples: 512,
            sample_rate: 48_000.0,
        })
        .unwrap();

    let mut block = stereo_block(64, 0.0);
    block.inputs = vec![AudioBusBuffer::zeroed(SampleWidth::F32, 33, 64)];
    assert!(matches!(
        proxy.process(&block).unwrap_err(),
        BridgeError::LimitExceeded { .. }
    ));
    // The instance is still healthy afterwards.
    assert_eq!(proxy.parameter_count().unwrap(), 2);
}

#[test]
fn test_destroy_and_second_object() {
    let instance = start_instance("destroy");
    let first = instance.client.create_object().unwrap();
    assert_eq!(first.handle(), ObjectHandle(1));
    assert_eq!(first.release(), 0);

    // The instance survives object destruction and hands out fresh handles.
    let second = instance.client.create_object().unwrap();
    assert_eq!(second.handle(), ObjectHandle(2));
    assert_eq!(second.parameter_count().unwrap(), 2);
}

#[test]
fn test_edit_gesture_callbacks_arrive_in_order() {
    let instance = start_instance("edits");
    let proxy = instance.client.create_object().unwrap();

    let args = bincode::serialize(&(100u32, 0.75f64)).unwrap();
    proxy
        .generic(ChannelKind::Main, GENERIC_EDIT_GESTURE, args)
        .unwrap()
        .expect("edit gesture should be implemented");

    assert_eq!(
        instance.handler.events(),
        vec![
            "begin_edit:100".to_string(),
            "perform_edit:100:0.75".to_string(),
            "end_edit:100".to_string(),
        ]
    );
}

#[test]
fn test_deferred_callback_runs_on_event_loop() {
    let instance = start_instance("deferred");
    let proxy = instance.client.create_object().unwrap();

    let (tx, rx) = mpsc::channel();
    *instance.handler.deferred.lock() = Some(tx);

    proxy
        .generic(ChannelKind::Main, GENERIC_REQUEST_DEFERRED, Vec::new())
        .unwrap()
        .expect("deferred request should be implemented");

    let object = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(object, proxy.handle());
}

#[test]
fn test_context_menu_lifecycle_across_the_bridge() {
    let instance = start_instance("menus");
    let proxy = instance.client.create_object().unwrap();

    let args = bincode::serialize(&(42i32, "Reset to default".to_string())).unwrap();
    let shown = proxy
        .generic(ChannelKind::Main, GENERIC_OPEN_MENU, args)
        .unwrap()
        .expect("menu support should be implemented");
    assert!(bincode::deserialize::<bool>(&shown).unwrap());

    // The host menu object was populated and popped up on the native side.
    assert_eq!(
        *instance.handler.menu_items.lock(),
        vec![(42, "Reset to default".to_string())]
    );
    assert_eq!(instance.handler.menu_popups.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.context_menus().len(), 1);

    // Selecting the item routes back to the plugin over the expedited
    // channel.
    proxy
        .context_menus()
        .select(ContextMenuHandle(0), 42)
        .unwrap();
    let tags = proxy
        .generic(ChannelKind::Main, GENERIC_SELECTED_TAGS, Vec::new())
        .unwrap()
        .unwrap();
    assert_eq!(bincode::deserialize::<Vec<i32>>(&tags).unwrap(), vec![42]);

    // Release drops the menu and its targets as one unit.
    proxy
        .generic(ChannelKind::Main, GENERIC_CLOSE_MENU, Vec::new())
        .unwrap()
        .unwrap();
    assert!(proxy.context_menus().is_empty());
}

#[test]
fn test_blocked_main_call_does_not_stall_audio() {
    let instance = start_instance("isolation");
    let proxy = instance.client.create_object().unwrap();
    proxy
        .setup_processing(ProcessSetup {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            max_block_samples: 512,
            sample_rate: 48_000.0,
        })
        .unwrap();
    proxy.set_processing(true).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *instance.handler.popup_gate.lock() = Some(PopupGate {
        entered: entered_tx,
        release: release_rx,
    });

    // Open a menu on the main channel; the popup parks inside the gate
    // with the main channel round trip still in flight.
    let opener = {
        let proxy = proxy.clone();
        thread::spawn(move || {
            let args = bincode::serialize(&(1i32, "Hold".to_string())).unwrap();
            proxy
                .generic(ChannelKind::Main, GENERIC_OPEN_MENU, args)
                .unwrap()
                .unwrap()
        })
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Audio keeps flowing while the main channel is parked.
    let block = stereo_block(128, 0.25);
    let result = proxy.process(&block).unwrap();
    assert_eq!(result.outputs, block.inputs);

    release_tx.send(()).unwrap();
    let shown = opener.join().unwrap();
    assert!(bincode::deserialize::<bool>(&shown).unwrap());
}

#[test]
fn test_popup_selection_resolves_synchronously() {
    let instance = start_instance("modal");
    let proxy = instance.client.create_object().unwrap();

    // The selection fires from inside popup, the way a modal native menu
    // does, and must round-trip over the expedited channel while the
    // opening call is still in flight on main.
    let selector = proxy.clone();
    *instance.handler.popup_action.lock() = Some(Box::new(move || {
        selector
            .context_menus()
            .select(ContextMenuHandle(0), 7)
            .unwrap();
    }));

    let args = bincode::serialize(&(7i32, "Pick me".to_string())).unwrap();
    let shown = proxy
        .generic(ChannelKind::Main, GENERIC_OPEN_MENU, args)
        .unwrap()
        .unwrap();
    assert!(bincode::deserialize::<bool>(&shown).unwrap());

    let tags = proxy
        .generic(ChannelKind::Main, GENERIC_SELECTED_TAGS, Vec::new())
        .unwrap()
        .unwrap();
    assert_eq!(bincode::deserialize::<Vec<i32>>(&tags).unwrap(), vec![7]);
}

#[test]
fn test_killed_host_process_latches_instance_dead() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        socket_path: dir.path().join("bridge.sock"),
        shm_prefix: format!("pontoon-loopback-dead-{}", std::process::id()),
        timeout_ms: 2_000,
        event_loop_tick_ms: 1,
    };
    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_pontoon-host"))
        .arg(&config.socket_path)
        .spawn()
        .unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let (client, event_loop) = BridgeClient::connect(config, handler).unwrap();
    thread::spawn(move || event_loop.run(|| {}));

    let proxy = client.create_object().unwrap();
    assert_eq!(proxy.parameter_count().unwrap(), 2);

    child.kill().unwrap();
    child.wait().unwrap();

    // The first call after death fails with a transport-level error...
    let first = proxy
        .bus_count(MediaType::Audio, BusDirection::Input)
        .unwrap_err();
    assert!(first.is_fatal(), "expected a fatal error, got: {first}");

    // ...and from then on everything is InstanceDead, on every channel.
    assert!(matches!(
        proxy.bus_count(MediaType::Audio, BusDirection::Input),
        Err(BridgeError::InstanceDead)
    ));
    assert!(matches!(
        proxy.can_process_sample_size(SampleWidth::F32),
        Err(BridgeError::InstanceDead)
    ));
    assert!(client.is_failed());
}
