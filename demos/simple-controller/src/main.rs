//! Minimal standalone binary: parses a couple of command-line flags,
//! wires a stub RPC transport into a running [`pnio_controller::ArManager`],
//! creates one AR, drives its lifecycle to RUN, and prints every state
//! change it sees. A thin, readable wiring example, not a feature
//! showcase.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pnio_controller::config::{ControllerBuilder, ControllerConfig};
use pnio_controller::state::{StateChange, StateChangeCallback};
use pnio_controller::test_support::{RecordingTransmitter, StubHttp, StubTransport};
use pnio_controller::transport::RpcTransport;
use pnio_controller::{ArConfig, RpcTransportFactory};
use pnio_core::error::PnioError;
use pnio_core::Config;
use pnio_types::slot::SlotInfo;
use pnio_types::timing::TimingProfile;

struct FixedRpcFactory(Arc<dyn RpcTransport>);

impl RpcTransportFactory for FixedRpcFactory {
    fn create(
        &self,
        _interface_name: &str,
        _controller_ip: Ipv4Addr,
    ) -> Result<Arc<dyn RpcTransport>, PnioError> {
        Ok(self.0.clone())
    }
}

struct PrintingCallback;

impl StateChangeCallback for PrintingCallback {
    fn on_state_change(&self, station_name: &str, change: StateChange) {
        println!("{station_name}: {:?} -> {:?}", change.old, change.new);
    }
}

fn main() {
    pnio_core::console_logging::init();

    let mut args = pico_args::Arguments::from_env();
    let station_name: String = args
        .opt_value_from_str("--station")
        .unwrap()
        .unwrap_or_else(|| "rtu-a".to_string());
    let device_ip: Ipv4Addr = args
        .opt_value_from_str("--device-ip")
        .unwrap()
        .unwrap_or_else(|| Ipv4Addr::new(192, 168, 0, 10));
    let config_path: Option<String> = args.opt_value_from_str("--config").unwrap();

    let config = match config_path {
        Some(path) => ControllerConfig::load(std::path::Path::new(&path))
            .unwrap_or_else(|e| panic!("failed to load --config {path}: {e}")),
        None => ControllerConfig {
            controller_station_name: "demo-controller".to_string(),
            interface_name: "eth0".to_string(),
            vendor_id: 0x002A,
            device_id: 0x0101,
            ..ControllerConfig::default()
        },
    };

    let transport: Arc<dyn RpcTransport> = Arc::new(StubTransport::always_succeeds());
    let manager = ControllerBuilder::new(config, [0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
        .with_controller_ip(Ipv4Addr::new(192, 168, 0, 1))
        .with_rpc_factory(Arc::new(FixedRpcFactory(transport)))
        .with_http_client(Arc::new(StubHttp::empty()))
        .with_transmitter(Arc::new(RecordingTransmitter::default()))
        .build()
        .expect("valid controller config");

    manager.set_state_callback(Arc::new(PrintingCallback));

    manager
        .create_ar(ArConfig {
            station_name: station_name.clone(),
            device_ip,
            device_mac: [0; 6],
            watchdog_ms: 0,
            slot_info: Vec::<SlotInfo>::new(),
            timing: TimingProfile::conservative_default(),
        })
        .expect("station name not already registered");

    manager
        .connect_with_discovery(&station_name)
        .expect("discovery against the stub transport cannot fail");

    for _ in 0..5 {
        manager.process();
        manager.check_health();
        if let Some(snapshot) = manager.get_ar(&station_name) {
            if snapshot.state == pnio_controller::ArState::Run {
                let _ = manager.send_output_data(&station_name);
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if let Some(snapshot) = manager.get_ar(&station_name) {
        println!(
            "final state for {station_name}: {:?} (retries={})",
            snapshot.state, snapshot.retry_count
        );
    }
}
