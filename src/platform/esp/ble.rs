// Pedal Firmware - Bluedroid GATT Server
//
// One primary service with the three exchange points. Reads and writes are
// answered by the app (`AutoResponse::ByApp`) so the session stays the single
// source of truth. Long writes (28-byte settings over a 23-byte MTU) arrive
// as prepared writes and are delivered on execute.
//
// Attributes are added one at a time, each waiting for the previous add to
// complete: characteristic, its 0x2901 user description, then the CCCD on
// Value. A failure anywhere in that chain is reported to the session, which
// tears the stack down and starts over.

use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, bail, Context};
use enumset::enum_set;
use esp_idf_hal::modem::Modem;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_svc::bt::ble::gap::{AdvConfiguration, BleGapEvent, EspBleGap};
use esp_idf_svc::bt::ble::gatt::server::{ConnectionId, EspGatts, GattsEvent, TransferId};
use esp_idf_svc::bt::ble::gatt::{
    AutoResponse, GattCharacteristic, GattDescriptor, GattId, GattInterface, GattResponse, GattServiceId, GattStatus,
    Handle, Permission, Property,
};
use esp_idf_svc::bt::{BdAddr, Ble, BtDriver, BtStatus, BtUuid};
use esp_idf_svc::nvs::EspDefaultNvsPartition;

use crate::config::{BLE_SERVICE_UUID, DEVICE_NAME};
use crate::lock;
use crate::transport::{ExchangePoint, SessionEvents, Transport};

const APP_ID: u16 = 0;
const USER_DESCRIPTION_UUID: u16 = 0x2901;
const CCCD_UUID: u16 = 0x2902;
// Service declaration, three characteristics (2 handles each) with a user
// description apiece, and the CCCD.
const SERVICE_HANDLES: u16 = 12;
const MAX_VALUE_LEN: usize = 64;

type Driver = BtDriver<'static, Ble>;
type Gap = EspBleGap<'static, Ble, Arc<Driver>>;
type Gatts = EspGatts<'static, Ble, Arc<Driver>>;

#[derive(Default)]
struct ServerState {
    gatt_if: Option<GattInterface>,
    service_handle: Option<Handle>,
    handles: Vec<(Handle, ExchangePoint)>,
    labels: Vec<(Handle, ExchangePoint)>,
    cccd: Option<(Handle, [u8; 2])>,
    // Characteristic whose descriptors are being added.
    adding: Option<ExchangePoint>,
    adv_configured: bool,
    scan_rsp_configured: bool,
    peers: Vec<(ConnectionId, BdAddr)>,
    prepared: Option<(Handle, Vec<u8>)>,
}

impl ServerState {
    fn point(&self, handle: Handle) -> Option<ExchangePoint> {
        self.handles
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, point)| *point)
    }

    fn handle(&self, point: ExchangePoint) -> Option<Handle> {
        self.handles
            .iter()
            .find(|(_, p)| *p == point)
            .map(|(handle, _)| *handle)
    }

    fn label(&self, handle: Handle) -> Option<&'static str> {
        self.labels
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, point)| point.label())
    }
}

struct Server {
    gap: Gap,
    gatts: Gatts,
    state: Mutex<ServerState>,
    events: Mutex<Option<Arc<dyn SessionEvents>>>,
}

impl Server {
    fn events(&self) -> Option<Arc<dyn SessionEvents>> {
        lock(&self.events).clone()
    }

    /// Run one step of the setup chain; a failure drops the whole stack.
    fn setup(&self, step: &str, run: impl FnOnce() -> anyhow::Result<()>) {
        if let Err(e) = run() {
            log::error!("BLE setup failed while {}: {:#}", step, e);
            if let Some(events) = self.events() {
                events.on_transport_failed(&format!("{step}: {e:#}"));
            }
        }
    }

    fn on_gap_event(&self, event: BleGapEvent) {
        match event {
            BleGapEvent::AdvertisingConfigured(status) => self.setup("configuring advertising", || {
                check_bt(status)?;
                lock(&self.state).adv_configured = true;
                self.advertise_when_configured()
            }),
            BleGapEvent::ScanResponseConfigured(status) => self.setup("configuring scan response", || {
                check_bt(status)?;
                lock(&self.state).scan_rsp_configured = true;
                self.advertise_when_configured()
            }),
            _ => {}
        }
    }

    fn advertise_when_configured(&self) -> anyhow::Result<()> {
        let ready = {
            let state = lock(&self.state);
            state.adv_configured && state.scan_rsp_configured
        };
        if ready {
            self.gap.start_advertising()?;
            log::info!("Advertising as {}", DEVICE_NAME);
        }
        Ok(())
    }

    fn on_gatts_event(&self, gatt_if: GattInterface, event: GattsEvent) -> anyhow::Result<()> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                if app_id == APP_ID {
                    self.setup("registering app", || {
                        check(status)?;
                        self.create_service(gatt_if)
                    });
                }
            }
            GattsEvent::ServiceCreated {
                status, service_handle, ..
            } => self.setup("creating service", || {
                check(status)?;
                lock(&self.state).service_handle = Some(service_handle);
                self.gatts.start_service(service_handle)?;
                self.add_characteristic(service_handle, ExchangePoint::ALL[0])
            }),
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                service_handle,
                char_uuid,
            } => self.setup("adding characteristic", || {
                check(status)?;
                self.register_characteristic(service_handle, attr_handle, char_uuid)
            }),
            GattsEvent::DescriptorAdded {
                status,
                attr_handle,
                service_handle,
                descr_uuid,
            } => self.setup("adding descriptor", || {
                check(status)?;
                self.register_descriptor(service_handle, attr_handle, descr_uuid)
            }),
            GattsEvent::PeerConnected { conn_id, addr, .. } => {
                lock(&self.state).peers.push((conn_id, addr));
                if let Some(events) = self.events() {
                    events.on_connect();
                }
            }
            GattsEvent::PeerDisconnected { addr, .. } => {
                {
                    let mut state = lock(&self.state);
                    state.peers.retain(|(_, peer)| *peer != addr);
                    state.prepared = None;
                }
                if let Some(events) = self.events() {
                    events.on_disconnect();
                }
            }
            GattsEvent::Read {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                ..
            } => {
                if need_rsp {
                    self.answer_read(gatt_if, conn_id, trans_id, handle, offset)?;
                }
            }
            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
                ..
            } => {
                self.receive_write(handle, offset, is_prep, value);
                if need_rsp {
                    self.answer_write(gatt_if, conn_id, trans_id, handle, offset, is_prep, value)?;
                }
            }
            GattsEvent::ExecWrite {
                conn_id,
                trans_id,
                canceled,
                ..
            } => {
                let prepared = lock(&self.state).prepared.take();
                if let (false, Some((handle, data))) = (canceled, prepared) {
                    self.deliver_write(handle, &data);
                }
                self.gatts
                    .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, None)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn create_service(&self, gatt_if: GattInterface) -> anyhow::Result<()> {
        lock(&self.state).gatt_if = Some(gatt_if);

        self.gap.set_device_name(DEVICE_NAME)?;
        self.gap.set_adv_conf(&AdvConfiguration {
            include_txpower: true,
            flag: 2,
            service_uuid: Some(BtUuid::uuid128(BLE_SERVICE_UUID)),
            ..Default::default()
        })?;
        // The 128-bit UUID leaves no room for the name in the advertising
        // packet; scanners get it from the scan response.
        self.gap.set_adv_conf(&AdvConfiguration {
            set_scan_rsp: true,
            include_name: true,
            ..Default::default()
        })?;
        self.gatts.create_service(
            gatt_if,
            &GattServiceId {
                id: GattId {
                    uuid: BtUuid::uuid128(BLE_SERVICE_UUID),
                    inst_id: 0,
                },
                is_primary: true,
            },
            SERVICE_HANDLES,
        )?;
        Ok(())
    }

    fn add_characteristic(&self, service_handle: Handle, point: ExchangePoint) -> anyhow::Result<()> {
        let (permissions, properties) = match point {
            ExchangePoint::Configuration => (
                enum_set!(Permission::Read | Permission::Write),
                enum_set!(Property::Read | Property::Write),
            ),
            ExchangePoint::Power => (enum_set!(Permission::Read), enum_set!(Property::Read)),
            ExchangePoint::Value => (enum_set!(Permission::Read), enum_set!(Property::Read | Property::Notify)),
        };
        lock(&self.state).adding = Some(point);
        self.gatts.add_characteristic(
            service_handle,
            &GattCharacteristic {
                uuid: BtUuid::uuid16(point.id()),
                permissions,
                properties,
                max_len: MAX_VALUE_LEN,
                auto_rsp: AutoResponse::ByApp,
            },
            &[],
        )?;
        Ok(())
    }

    fn register_characteristic(&self, service_handle: Handle, attr_handle: Handle, uuid: BtUuid) -> anyhow::Result<()> {
        let point = {
            let mut state = lock(&self.state);
            if state.service_handle != Some(service_handle) {
                return Ok(());
            }
            let point = state.adding.context("characteristic added out of order")?;
            if BtUuid::uuid16(point.id()) != uuid {
                bail!("expected {} characteristic, got {:?}", point.label(), uuid);
            }
            state.handles.push((attr_handle, point));
            point
        };

        log::info!("{} characteristic at handle {}", point.label(), attr_handle);
        self.add_descriptor(service_handle, USER_DESCRIPTION_UUID, enum_set!(Permission::Read))
    }

    fn register_descriptor(&self, service_handle: Handle, attr_handle: Handle, uuid: BtUuid) -> anyhow::Result<()> {
        let point = {
            let mut state = lock(&self.state);
            if state.service_handle != Some(service_handle) {
                return Ok(());
            }
            let point = state.adding.context("descriptor added out of order")?;
            if uuid == BtUuid::uuid16(USER_DESCRIPTION_UUID) {
                state.labels.push((attr_handle, point));
            } else {
                state.cccd = Some((attr_handle, [0, 0]));
            }
            point
        };

        if uuid == BtUuid::uuid16(USER_DESCRIPTION_UUID) && point.notifies() {
            return self.add_descriptor(
                service_handle,
                CCCD_UUID,
                enum_set!(Permission::Read | Permission::Write),
            );
        }

        let next = ExchangePoint::ALL
            .into_iter()
            .skip_while(|p| *p != point)
            .nth(1);
        match next {
            Some(next) => self.add_characteristic(service_handle, next),
            None => {
                lock(&self.state).adding = None;
                log::info!("GATT service ready");
                Ok(())
            }
        }
    }

    fn add_descriptor(
        &self,
        service_handle: Handle,
        uuid: u16,
        permissions: enumset::EnumSet<Permission>,
    ) -> anyhow::Result<()> {
        self.gatts.add_descriptor(
            service_handle,
            &GattDescriptor {
                uuid: BtUuid::uuid16(uuid),
                permissions,
            },
        )?;
        Ok(())
    }

    fn answer_read(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        handle: Handle,
        offset: u16,
    ) -> anyhow::Result<()> {
        let (point, label, cccd) = {
            let state = lock(&self.state);
            let cccd = state.cccd.filter(|(h, _)| *h == handle).map(|(_, value)| value);
            (state.point(handle), state.label(handle), cccd)
        };
        let data = match (point, label, cccd, self.events()) {
            (Some(point), _, _, Some(events)) => events.on_read(point),
            (_, Some(label), _, _) => label.as_bytes().to_vec(),
            (_, _, Some(value), _) => value.to_vec(),
            _ => Vec::new(),
        };
        let start = usize::from(offset).min(data.len());

        let mut response = GattResponse::new();
        response
            .attr_handle(handle)
            .auth_req(0)
            .offset(offset)
            .value(&data[start..])
            .map_err(|_| anyhow!("read response too long"))?;
        self.gatts
            .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, Some(&response))?;
        Ok(())
    }

    fn receive_write(&self, handle: Handle, offset: u16, is_prep: bool, value: &[u8]) {
        if !is_prep {
            self.deliver_write(handle, value);
            return;
        }

        let mut state = lock(&self.state);
        let prepared = state.prepared.get_or_insert_with(|| (handle, Vec::new()));
        if prepared.0 != handle || usize::from(offset) != prepared.1.len() {
            log::warn!("Out-of-order prepared write on handle {}", handle);
            state.prepared = None;
            return;
        }
        prepared.1.extend_from_slice(value);
    }

    fn deliver_write(&self, handle: Handle, data: &[u8]) {
        let point = {
            let mut state = lock(&self.state);
            if let Some((cccd, value)) = state.cccd.as_mut() {
                if *cccd == handle {
                    if let &[lo, hi] = data {
                        *value = [lo, hi];
                    }
                    return;
                }
            }
            state.point(handle)
        };
        let Some(point) = point else {
            return;
        };
        if let Some(events) = self.events() {
            events.on_write(point, data);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn answer_write(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        handle: Handle,
        offset: u16,
        is_prep: bool,
        value: &[u8],
    ) -> anyhow::Result<()> {
        if is_prep {
            // Prepared writes echo the chunk back.
            let mut response = GattResponse::new();
            response
                .attr_handle(handle)
                .auth_req(0)
                .offset(offset)
                .value(value)
                .map_err(|_| anyhow!("write response too long"))?;
            self.gatts
                .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, Some(&response))?;
        } else {
            self.gatts
                .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, None)?;
        }
        Ok(())
    }
}

fn check(status: GattStatus) -> anyhow::Result<()> {
    if status != GattStatus::Ok {
        bail!("GATT operation failed: {:?}", status);
    }
    Ok(())
}

fn check_bt(status: BtStatus) -> anyhow::Result<()> {
    if status != BtStatus::Success {
        bail!("GAP operation failed: {:?}", status);
    }
    Ok(())
}

/// [`Transport`] over the ESP32 Bluedroid stack. The controller comes up in
/// `start`, so a failed bring-up is retried by calling `start` again.
pub struct GattTransport {
    modem: Modem,
    nvs: EspDefaultNvsPartition,
    server: Option<Arc<Server>>,
}

impl GattTransport {
    pub fn new(modem: Modem, nvs: EspDefaultNvsPartition) -> Self {
        Self {
            modem,
            nvs,
            server: None,
        }
    }

    fn server(&self) -> anyhow::Result<&Arc<Server>> {
        self.server.as_ref().context("BLE stack not started")
    }
}

impl Transport for GattTransport {
    fn start(&mut self, events: Arc<dyn SessionEvents>) -> anyhow::Result<()> {
        // Only one controller may exist; the previous one goes first.
        if self.server.take().is_some() {
            log::info!("Tearing down BLE stack");
        }

        // SAFETY: the driver built on the previous clone was dropped above,
        // so this is the only live user of the modem.
        let modem = unsafe { self.modem.clone_unchecked() };
        let driver = Arc::new(BtDriver::new(modem, Some(self.nvs.clone())).context("starting BT controller")?);
        let server = Arc::new(Server {
            gap: EspBleGap::new(driver.clone())?,
            gatts: EspGatts::new(driver)?,
            state: Mutex::new(ServerState::default()),
            events: Mutex::new(Some(events)),
        });

        let gap_server: Weak<Server> = Arc::downgrade(&server);
        server.gap.subscribe(move |event| {
            if let Some(server) = gap_server.upgrade() {
                server.on_gap_event(event);
            }
        })?;

        let gatts_server: Weak<Server> = Arc::downgrade(&server);
        server.gatts.subscribe(move |(gatt_if, event)| {
            let Some(server) = gatts_server.upgrade() else {
                return;
            };
            if let Err(e) = server.on_gatts_event(gatt_if, event) {
                log::warn!("GATTS event failed: {:#}", e);
            }
        })?;

        server.gatts.register_app(APP_ID).context("registering GATT app")?;
        self.server = Some(server);
        Ok(())
    }

    fn start_advertising(&mut self) -> anyhow::Result<()> {
        self.server()?.gap.start_advertising()?;
        Ok(())
    }

    fn connected_count(&self) -> usize {
        self.server
            .as_ref()
            .map_or(0, |server| lock(&server.state).peers.len())
    }

    fn notify(&mut self, point: ExchangePoint, data: &[u8]) -> anyhow::Result<()> {
        let server = self.server()?;
        let (gatt_if, handle, peers) = {
            let state = lock(&server.state);
            let gatt_if = state.gatt_if.context("GATT app not registered")?;
            let handle = state
                .handle(point)
                .with_context(|| format!("{} not published", point.label()))?;
            (gatt_if, handle, state.peers.clone())
        };

        for (conn_id, _) in peers {
            server.gatts.notify(gatt_if, conn_id, handle, data)?;
        }
        Ok(())
    }

    fn disconnect_all(&mut self) -> anyhow::Result<()> {
        let Some(server) = self.server.as_ref() else {
            return Ok(());
        };
        let (gatt_if, peers) = {
            let state = lock(&server.state);
            (state.gatt_if, state.peers.clone())
        };
        let Some(gatt_if) = gatt_if else {
            return Ok(());
        };

        for (conn_id, addr) in peers {
            log::info!("Closing connection to {:?}", addr);
            server.gatts.close(gatt_if, conn_id)?;
        }
        Ok(())
    }
}
