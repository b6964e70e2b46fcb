// Pedal Firmware - Wireless Transport Interface
//
// The BLE stack is an external collaborator. It publishes three exchange
// points under one service and reports connection and read/write events
// back to the session through `SessionEvents`.

use std::sync::Arc;

use crate::config::{BLE_BATTERY_ID, BLE_SETTINGS_ID, BLE_VALUE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangePoint {
    /// Current Settings, readable and writable.
    Configuration,
    /// Battery raw reading and percentage, read-only.
    Power,
    /// Latest SensorValue, readable and notified.
    Value,
}

impl ExchangePoint {
    pub const ALL: [ExchangePoint; 3] = [
        ExchangePoint::Configuration,
        ExchangePoint::Power,
        ExchangePoint::Value,
    ];

    /// 16-bit id on the Bluetooth base UUID.
    pub fn id(self) -> u16 {
        match self {
            ExchangePoint::Configuration => BLE_SETTINGS_ID,
            ExchangePoint::Power => BLE_BATTERY_ID,
            ExchangePoint::Value => BLE_VALUE_ID,
        }
    }

    /// Text served from the point's 0x2901 user description descriptor.
    pub fn label(self) -> &'static str {
        match self {
            ExchangePoint::Configuration => "Settings",
            ExchangePoint::Power => "Battery",
            ExchangePoint::Value => "Value",
        }
    }

    pub fn is_writable(self) -> bool {
        self == ExchangePoint::Configuration
    }

    pub fn notifies(self) -> bool {
        self == ExchangePoint::Value
    }
}

/// Callbacks from the transport into the session. Called from the stack's
/// own context.
pub trait SessionEvents: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self);
    /// Bytes to answer a peer read with.
    fn on_read(&self, point: ExchangePoint) -> Vec<u8>;
    fn on_write(&self, point: ExchangePoint, data: &[u8]);
    /// The stack failed after `start` returned (a late registration step,
    /// or a controller fault). Peers are gone; `start` must run again.
    fn on_transport_failed(&self, reason: &str);
}

pub trait Transport: Send {
    /// Bring the stack up, publish the exchange points and begin
    /// advertising. Events flow to `events` from then on. Calling it again
    /// tears down whatever a previous call left behind.
    fn start(&mut self, events: Arc<dyn SessionEvents>) -> anyhow::Result<()>;

    fn start_advertising(&mut self) -> anyhow::Result<()>;

    fn connected_count(&self) -> usize;

    /// Push `data` to every connected peer on `point`.
    fn notify(&mut self, point: ExchangePoint, data: &[u8]) -> anyhow::Result<()>;

    /// Ask the stack to drop every peer. Completion arrives later as
    /// `on_disconnect` events.
    fn disconnect_all(&mut self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_capabilities() {
        let ids: Vec<u16> = ExchangePoint::ALL.iter().map(|point| point.id()).collect();
        assert_eq!(ids, vec![0x0001, 0x0002, 0x0003]);

        let writable: Vec<_> = ExchangePoint::ALL.into_iter().filter(|p| p.is_writable()).collect();
        assert_eq!(writable, vec![ExchangePoint::Configuration]);
        let notifying: Vec<_> = ExchangePoint::ALL.into_iter().filter(|p| p.notifies()).collect();
        assert_eq!(notifying, vec![ExchangePoint::Value]);
    }
}
