use std::{future, net::SocketAddr};
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

use crate::orchestrator::{Event, ThresholdBound};
use crate::publisher::{
    switch_state_path, PublishedStore, CHARGED_VOLTAGE_PATH, COLD_POSITION_PATH, DISCOVERY_ENABLED_PATH, HOT_POSITION_PATH,
};
use crate::selector::{SLIDER_MAX_POSITION, SLIDER_MIN_POSITION};

/// Read-only holding register mirroring one published path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub address: u16,
    pub path: &'static str,
    /// Multiplier applied before rounding to the register word.
    pub scale: f64,
    pub signed: bool,
}

const fn reg(address: u16, path: &'static str, scale: f64, signed: bool) -> RegisterDef {
    RegisterDef {
        address,
        path,
        scale,
        signed,
    }
}

pub const REGISTER_MAP: [RegisterDef; 39] = [
    reg(1, "/ProductId", 1.0, false),
    reg(2, "/DeviceInstance", 1.0, false),
    reg(3, "/Connected", 1.0, false),
    reg(258, "/Dc/0/Power", 1.0, true),
    reg(259, "/Dc/0/Voltage", 100.0, false),
    reg(261, "/Dc/0/Current", 10.0, true),
    reg(262, "/Dc/0/Temperature", 10.0, true),
    reg(265, "/ConsumedAmphours", 10.0, true),
    reg(266, "/Soc", 10.0, false),
    reg(267, "/Alarms/Alarm", 1.0, false),
    reg(268, "/Alarms/LowVoltage", 1.0, false),
    reg(269, "/Alarms/HighVoltage", 1.0, false),
    reg(272, "/Alarms/LowSoc", 1.0, false),
    reg(276, "/Alarms/HighTemperature", 1.0, false),
    reg(277, "/Alarms/LowTemperature", 1.0, false),
    reg(280, "/History/DeepestDischarge", 10.0, true),
    reg(281, "/History/LastDischarge", 10.0, true),
    reg(282, "/History/AverageDischarge", 10.0, true),
    reg(283, "/History/ChargeCycles", 1.0, false),
    reg(284, "/History/FullDischarges", 1.0, false),
    reg(285, "/History/TotalAhDrawn", 1.0, true),
    reg(286, "/History/MinimumVoltage", 100.0, false),
    reg(287, "/History/MaximumVoltage", 100.0, false),
    reg(288, "/History/TimeSinceLastFullCharge", 1.0 / 3600.0, false),
    reg(289, "/History/AutomaticSyncs", 1.0, false),
    reg(290, "/History/LowVoltageAlarms", 1.0, false),
    reg(291, "/History/HighVoltageAlarms", 1.0, false),
    reg(294, "/History/MinimumStarterVoltage", 100.0, false),
    reg(295, "/History/MaximumStarterVoltage", 100.0, false),
    reg(296, "/History/DischargedEnergy", 10.0, false),
    reg(297, "/History/ChargedEnergy", 10.0, false),
    reg(303, "/TimeToGo", 0.01, false),
    reg(310, "/VEDirect/HexChecksumErrors", 1.0, false),
    reg(311, "/VEDirect/HexInvalidCharacterErrors", 1.0, false),
    reg(312, "/VEDirect/HexUnfinishedErrors", 1.0, false),
    reg(313, "/VEDirect/TextChecksumErrors", 1.0, false),
    reg(314, "/VEDirect/TextParseError", 1.0, false),
    reg(315, "/VEDirect/TextUnfinishedErrors", 1.0, false),
    reg(320, CHARGED_VOLTAGE_PATH, 100.0, false),
];

/// `SWITCH_BASE + switch_index`: manual enable of one device.
pub const SWITCH_BASE: u16 = 3000;
pub const SWITCH_SLOTS: u16 = 100;
pub const COLD_POSITION_REGISTER: u16 = 3100;
pub const HOT_POSITION_REGISTER: u16 = 3101;
pub const DISCOVERY_ENABLED_REGISTER: u16 = 3102;

/// Word published for an absent unsigned value.
pub const UNSIGNED_EMPTY: u16 = 0xFFFF;
/// Word published for an absent signed value.
pub const SIGNED_EMPTY: u16 = 0x7FFF;

/// Scales a value into a register word, saturating below the empty markers.
pub fn encode(value: Option<f64>, scale: f64, signed: bool) -> u16 {
    match (value, signed) {
        (None, false) => UNSIGNED_EMPTY,
        (None, true) => SIGNED_EMPTY,
        (Some(v), false) => (v * scale).round().clamp(0.0, f64::from(UNSIGNED_EMPTY - 1)) as u16,
        (Some(v), true) => {
            let word = (v * scale)
                .round()
                .clamp(f64::from(i16::MIN), f64::from(i16::MAX - 1)) as i16;
            word as u16
        }
    }
}

/// Modbus view of the published store. Writes to the control registers become events.
#[derive(Clone)]
pub struct RegisterServer {
    store: PublishedStore,
    events: Sender<Event>,
}

impl tokio_modbus::server::Service for RegisterServer {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::WriteSingleRegister(addr, value) => self
                .write_register(addr, value)
                .map(|()| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => {
                let count = values.len() as u16;
                self.write_registers(addr, &values)
                    .map(|()| Response::WriteMultipleRegisters(addr, count))
            }
            _ => {
                debug!("Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl RegisterServer {
    pub fn new(store: PublishedStore, events: Sender<Event>) -> Self {
        Self { store, events }
    }

    /// Resolves the whole range from one commit of the store.
    fn read_registers(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let sources = (0..cnt)
            .map(|i| {
                let reg_addr = addr.checked_add(i).ok_or(ExceptionCode::IllegalDataAddress)?;
                register_source(reg_addr).ok_or_else(|| {
                    debug!("Read of unmapped register {reg_addr}/0x{reg_addr:X}");
                    ExceptionCode::IllegalDataAddress
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let paths: Vec<&str> = sources.iter().map(|source| source.path.as_str()).collect();
        let values = self.store.numbers(&paths);
        Ok(sources
            .iter()
            .zip(values)
            .map(|(source, value)| encode(value, source.scale, source.signed))
            .collect())
    }

    fn write_register(&self, addr: u16, value: u16) -> Result<(), ExceptionCode> {
        let event = self.control_event(addr, value)?;
        info!("Control write {addr} = {value}");
        self.send(addr, event)
    }

    /// All registers are validated before any of them is applied.
    fn write_registers(&self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let events = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let reg_addr = u16::try_from(i)
                    .ok()
                    .and_then(|i| addr.checked_add(i))
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                self.control_event(reg_addr, *value)
            })
            .collect::<Result<Vec<_>, _>>()?;
        if self.events.capacity() < events.len() {
            warn!("Dropping control write of {} registers at {addr}: event queue full", events.len());
            return Err(ExceptionCode::ServerDeviceBusy);
        }
        info!("Control write {addr} = {values:?}");
        events.into_iter().try_for_each(|event| self.send(addr, event))
    }

    fn send(&self, addr: u16, event: Event) -> Result<(), ExceptionCode> {
        self.events.try_send(event).map_err(|e| {
            warn!("Dropping control write at {addr}: {e}");
            ExceptionCode::ServerDeviceBusy
        })
    }

    fn control_event(&self, addr: u16, value: u16) -> Result<Event, ExceptionCode> {
        let event = match addr {
            a if (SWITCH_BASE..SWITCH_BASE + SWITCH_SLOTS).contains(&a) => {
                let switch_index = a - SWITCH_BASE;
                // only switches of present devices are writable
                if self.store.number(&switch_state_path(switch_index)).is_none() {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                Event::SwitchToggled {
                    switch_index,
                    enabled: parse_flag(value)?,
                }
            }
            COLD_POSITION_REGISTER => Event::ThresholdPositionChanged {
                bound: ThresholdBound::Cold,
                position: parse_position(value)?,
            },
            HOT_POSITION_REGISTER => Event::ThresholdPositionChanged {
                bound: ThresholdBound::Hot,
                position: parse_position(value)?,
            },
            DISCOVERY_ENABLED_REGISTER => Event::DiscoveryEnabledChanged(parse_flag(value)?),
            _ => {
                debug!("Write to read-only or unmapped register {addr}/0x{addr:X}");
                return Err(ExceptionCode::IllegalDataAddress);
            }
        };
        Ok(event)
    }
}

struct RegisterSource {
    path: String,
    scale: f64,
    signed: bool,
}

fn register_source(addr: u16) -> Option<RegisterSource> {
    if let Some(def) = REGISTER_MAP.iter().find(|def| def.address == addr) {
        return Some(RegisterSource {
            path: def.path.to_string(),
            scale: def.scale,
            signed: def.signed,
        });
    }
    control_path(addr).map(|path| RegisterSource {
        path,
        scale: 1.0,
        signed: false,
    })
}

fn control_path(addr: u16) -> Option<String> {
    match addr {
        a if (SWITCH_BASE..SWITCH_BASE + SWITCH_SLOTS).contains(&a) => Some(switch_state_path(a - SWITCH_BASE)),
        COLD_POSITION_REGISTER => Some(COLD_POSITION_PATH.to_string()),
        HOT_POSITION_REGISTER => Some(HOT_POSITION_PATH.to_string()),
        DISCOVERY_ENABLED_REGISTER => Some(DISCOVERY_ENABLED_PATH.to_string()),
        _ => None,
    }
}

fn parse_flag(value: u16) -> Result<bool, ExceptionCode> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ExceptionCode::IllegalDataValue),
    }
}

fn parse_position(value: u16) -> Result<u8, ExceptionCode> {
    u8::try_from(value)
        .ok()
        .filter(|p| (SLIDER_MIN_POSITION..=SLIDER_MAX_POSITION).contains(p))
        .ok_or(ExceptionCode::IllegalDataValue)
}

/// Serves `server` on `listener` until the listener fails.
pub async fn serve(listener: TcpListener, server: RegisterServer) -> anyhow::Result<()> {
    let socket_addr: SocketAddr = listener.local_addr()?;
    info!("Register server listening on {socket_addr}");
    let modbus = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(server.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Register server error: {err}");
    };
    modbus.serve(&on_connected, on_process_error).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Value;
    use crate::snapshot::Field;
    use tokio::sync::mpsc;
    use tokio_modbus::server::Service;

    fn server() -> (RegisterServer, PublishedStore, mpsc::Receiver<Event>) {
        let store = PublishedStore::new();
        let (tx, rx) = mpsc::channel(8);
        (RegisterServer::new(store.clone(), tx), store, rx)
    }

    #[test]
    fn test_every_field_has_a_register() {
        for field in Field::ALL {
            assert!(
                REGISTER_MAP.iter().any(|def| def.path == field.path()),
                "{} has no register",
                field.path()
            );
        }
        let mut addresses: Vec<u16> = REGISTER_MAP.iter().map(|def| def.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), REGISTER_MAP.len());
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(Some(13.1), 100.0, false), 1310);
        assert_eq!(encode(Some(-8.0), 10.0, true), (-80i16) as u16);
        assert_eq!(encode(None, 1.0, false), 0xFFFF);
        assert_eq!(encode(None, 1.0, true), 0x7FFF);
        assert_eq!(encode(Some(1e9), 1.0, false), 0xFFFE);
        assert_eq!(encode(Some(-5.0), 1.0, false), 0);
        assert_eq!(encode(Some(1e9), 1.0, true), 0x7FFE);
    }

    #[tokio::test]
    async fn test_read_published_values() {
        let (server, store, _rx) = server();
        store.commit(vec![
            ("/Dc/0/Voltage".to_string(), Value::Float(13.1)),
            ("/Dc/0/Current".to_string(), Value::Float(-8.0)),
            ("/Dc/0/Temperature".to_string(), Value::Empty),
            ("/TimeToGo".to_string(), Value::Float(67500.0)),
        ]);

        let response = server.call(Request::ReadHoldingRegisters(259, 1)).await.unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![1310]));

        let response = server.call(Request::ReadHoldingRegisters(261, 2)).await.unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![(-80i16) as u16, 0x7FFF]));

        // 260 is a gap in the map
        assert!(server.call(Request::ReadHoldingRegisters(259, 3)).await.is_err());

        let response = server.call(Request::ReadInputRegisters(303, 1)).await.unwrap();
        assert_eq!(response, Response::ReadInputRegisters(vec![675]));
    }

    #[tokio::test]
    async fn test_unmapped_register_is_illegal() {
        let (server, _store, _rx) = server();
        let err = server.call(Request::ReadHoldingRegisters(40000, 2)).await.unwrap_err();
        assert_eq!(err, ExceptionCode::IllegalDataAddress);
    }

    #[tokio::test]
    async fn test_control_writes_become_events() {
        let (server, store, mut rx) = server();
        store.commit([(switch_state_path(1), Value::Int(1))]);

        server.call(Request::WriteSingleRegister(3001, 0)).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::SwitchToggled { switch_index: 1, enabled: false }
        ));

        server.call(Request::WriteSingleRegister(3101, 61)).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::ThresholdPositionChanged { bound: ThresholdBound::Hot, position: 61 }
        ));

        server.call(Request::WriteSingleRegister(3102, 0)).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Event::DiscoveryEnabledChanged(false)));
    }

    #[tokio::test]
    async fn test_invalid_control_writes() {
        let (server, store, mut rx) = server();
        store.commit([(switch_state_path(0), Value::Int(1))]);

        let cases = [
            (3000, 2, ExceptionCode::IllegalDataValue),
            (3005, 1, ExceptionCode::IllegalDataAddress),
            (3100, 0, ExceptionCode::IllegalDataValue),
            (3100, 101, ExceptionCode::IllegalDataValue),
            (259, 1, ExceptionCode::IllegalDataAddress),
        ];
        for (addr, value, expected) in cases {
            let err = server.call(Request::WriteSingleRegister(addr, value)).await.unwrap_err();
            assert_eq!(err, expected, "write {addr} = {value}");
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_range_read_comes_from_one_commit() {
        let (server, store, _rx) = server();
        let writer = std::thread::spawn(move || {
            for n in 0..20_000u32 {
                let n = f64::from(n % 3000);
                store.commit(vec![
                    ("/Dc/0/Current".to_string(), Value::Float(-n)),
                    ("/Dc/0/Temperature".to_string(), Value::Float(n)),
                ]);
            }
        });
        while !writer.is_finished() {
            let words = server.read_registers(261, 2).unwrap();
            if words == [SIGNED_EMPTY, SIGNED_EMPTY] {
                continue;
            }
            assert_eq!(words[0] as i16, -(words[1] as i16), "mixed commits in {words:?}");
        }
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_multi_register_write_is_all_or_nothing() {
        let (server, _store, mut rx) = server();

        let err = server
            .call(Request::WriteMultipleRegisters(3100, vec![41, 0].into()))
            .await
            .unwrap_err();
        assert_eq!(err, ExceptionCode::IllegalDataValue);
        assert!(rx.try_recv().is_err());

        let response = server
            .call(Request::WriteMultipleRegisters(3100, vec![41, 61].into()))
            .await
            .unwrap();
        assert_eq!(response, Response::WriteMultipleRegisters(3100, 2));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::ThresholdPositionChanged { bound: ThresholdBound::Cold, position: 41 }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::ThresholdPositionChanged { bound: ThresholdBound::Hot, position: 61 }
        ));
    }

    #[tokio::test]
    async fn test_multi_register_write_needs_room_for_every_event() {
        let store = PublishedStore::new();
        let (tx, mut rx) = mpsc::channel(1);
        let server = RegisterServer::new(store, tx);
        let err = server
            .call(Request::WriteMultipleRegisters(3100, vec![41, 61].into()))
            .await
            .unwrap_err();
        assert_eq!(err, ExceptionCode::ServerDeviceBusy);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_controls_read_back() {
        let (server, store, _rx) = server();
        store.commit(vec![
            (COLD_POSITION_PATH.to_string(), Value::Int(41)),
            (HOT_POSITION_PATH.to_string(), Value::Int(61)),
            (DISCOVERY_ENABLED_PATH.to_string(), Value::Int(1)),
        ]);
        let response = server.call(Request::ReadHoldingRegisters(3100, 3)).await.unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![41, 61, 1]));
    }
}
