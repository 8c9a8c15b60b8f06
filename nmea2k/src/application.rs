//! Controller Application: one virtual NMEA2000 device hosted by this process
//! (spec §4.E).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::group_function::{
    AcknowledgeGroupFunction, AddressClaim, CommandedAddress, ConfigurationInformation, GroupFunction, Heartbeat,
    IsoRequest, ParamError, ProductInformation, PGN_ADDRESS_CLAIM, PGN_COMMANDED_ADDRESS, PGN_CONFIGURATION_INFORMATION,
    PGN_GROUP_FUNCTION, PGN_PRODUCT_INFORMATION,
};
use crate::message::NMEA2000Msg;
use crate::name::{identity_root_from_mac, Name};

const ADDRESS_CLAIM_DELAY: Duration = Duration::from_millis(400);
const UNAVAILABLE_ADDRESS: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    WaitForBus,
    AddressClaim,
    Active,
    StopInProgress,
}

/// Draws fresh `(address, name)` pairs for applications hosted by this process
/// (spec §4.E "Address allocation pool").
pub struct ApplicationPool {
    mfg_code: u16,
    identity_root: u64,
    max_applications: u32,
    address_pool: Vec<u8>,
    pool_index: usize,
    application_count: u32,
}

impl ApplicationPool {
    pub fn new(mac_source: &str, mfg_code: u16, max_applications: u32, first_address: u8) -> Self {
        let identity_root = identity_root_from_mac(mac_source) << max_applications.saturating_sub(1).max(1).ilog2().max(1);
        let pool_size = (2 * max_applications + 1) as u8;
        let address_pool = (first_address..first_address.saturating_add(pool_size)).collect();
        ApplicationPool { mfg_code, identity_root, max_applications, address_pool, pool_index: 0, application_count: 0 }
    }

    pub fn next_name(&mut self) -> Option<Name> {
        if self.application_count >= self.max_applications {
            warn!("application pool exhausted: no more NAMEs available");
            return None;
        }
        let name = Name::from_parts(
            self.identity_root | self.application_count as u64,
            self.mfg_code as u64,
            0,
            0,
            130,
            25,
            0,
            4,
            1,
        );
        self.application_count += 1;
        Some(name)
    }

    pub fn next_address(&mut self, taken: &[u8]) -> u8 {
        while self.pool_index < self.address_pool.len() {
            let address = self.address_pool[self.pool_index];
            self.pool_index += 1;
            if !taken.contains(&address) {
                return address;
            }
        }
        warn!("address pool exhausted");
        UNAVAILABLE_ADDRESS
    }
}

/// One hosted virtual device: state machine, heartbeat, ISO request/group-function
/// responses. Outgoing messages accumulate in `outbox` for the controller to drain
/// and hand to the CAN interface (spec §4.F dispatch, §4.D send).
pub struct NMEA2000Application {
    pub address: u8,
    pub name: Name,
    pub state: AppState,
    pub heartbeat_interval: Duration,
    sequence: u8,
    claim_deadline: Option<Instant>,
    next_heartbeat: Option<Instant>,
    product_information: ProductInformation,
    configuration_information: ConfigurationInformation,
    outbox: VecDeque<NMEA2000Msg>,
    received: VecDeque<NMEA2000Msg>,
}

impl NMEA2000Application {
    pub fn new(address: u8, name: Name) -> Self {
        let mut product_information = ProductInformation::default();
        product_information.sa = address;
        product_information.set_product_information("NMEA MESSAGE ROUTER", "Version 1.0", "ROUTER", "00001");
        let mut configuration_information = ConfigurationInformation::default();
        configuration_information.sa = address;

        NMEA2000Application {
            address,
            name,
            state: AppState::WaitForBus,
            heartbeat_interval: Duration::from_secs(60),
            sequence: 0,
            claim_deadline: None,
            next_heartbeat: None,
            product_information,
            configuration_information,
            outbox: VecDeque::new(),
            received: VecDeque::new(),
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<NMEA2000Msg> {
        self.outbox.drain(..).collect()
    }

    /// Delivers a non-ISO data message addressed or subscribed to this
    /// application (spec §4.F dispatch table).
    pub fn receive_data_msg(&mut self, msg: NMEA2000Msg) {
        debug!(address = self.address, pgn = msg.pgn, "data message delivered");
        self.received.push_back(msg);
    }

    pub fn drain_received(&mut self) -> Vec<NMEA2000Msg> {
        self.received.drain(..).collect()
    }

    /// Bus has become usable: move to ADDRESS_CLAIM and emit the claim frame.
    pub fn wait_for_bus_ready(&mut self) {
        self.send_address_claim();
    }

    fn send_address_claim(&mut self) {
        if self.state == AppState::StopInProgress {
            return;
        }
        let claim = AddressClaim::new(self.address, 0xFF, self.name);
        self.outbox.push_back(claim.message());
        self.state = AppState::AddressClaim;
        self.claim_deadline = Some(Instant::now() + ADDRESS_CLAIM_DELAY);
        debug!(address = self.address, "sent address claim");
    }

    /// Called periodically (faster than the once-per-second controller timer) so the
    /// 400ms claim window and heartbeat interval are honored promptly.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.state == AppState::AddressClaim {
            if let Some(deadline) = self.claim_deadline {
                if now >= deadline {
                    self.activate(now);
                }
            }
        }
        if self.state == AppState::Active {
            if let Some(next) = self.next_heartbeat {
                if now >= next {
                    self.send_heartbeat(now);
                }
            }
        }
    }

    fn activate(&mut self, now: Instant) {
        self.state = AppState::Active;
        self.claim_deadline = None;
        let request = IsoRequest::new(self.address, 0xFF, PGN_ADDRESS_CLAIM);
        self.outbox.push_back(request.message());
        self.send_heartbeat(now);
        info!(address = self.address, "application active");
    }

    fn send_heartbeat(&mut self, now: Instant) {
        if self.state == AppState::StopInProgress {
            return;
        }
        let heartbeat = Heartbeat { sa: self.address, interval_ms: self.heartbeat_interval.as_millis() as u32, sequence: self.sequence };
        self.outbox.push_back(heartbeat.message());
        self.sequence = if self.sequence >= 253 { 0 } else { self.sequence + 1 };
        self.next_heartbeat = Some(now + self.heartbeat_interval);
    }

    pub fn stop_request(&mut self) {
        self.state = AppState::StopInProgress;
        self.next_heartbeat = None;
    }

    /// An address claim arrived from someone else on the wire. Returns `Some(new_address)`
    /// if this application must change address (pool exhausted is signalled as `Some(254)`).
    pub fn handle_address_claim_conflict(&mut self, claim: &AddressClaim, pool: &mut ApplicationPool, taken: &[u8]) -> Option<u8> {
        if claim.sa != self.address {
            return None;
        }
        if let Some(deadline) = self.claim_deadline.take() {
            let _ = deadline;
        }
        if claim.name < self.name {
            let new_address = pool.next_address(taken);
            if new_address == UNAVAILABLE_ADDRESS {
                warn!("cannot obtain a CAN address, going offline");
                let cannot_claim = AddressClaim::new(self.address, claim.sa, self.name);
                self.outbox.push_back(cannot_claim.message());
                return Some(UNAVAILABLE_ADDRESS);
            }
            Some(new_address)
        } else {
            info!(address = self.address, "keeping address, our NAME wins arbitration");
            self.send_address_claim_response(claim.sa);
            None
        }
    }

    fn send_address_claim_response(&mut self, da: u8) {
        let claim = AddressClaim::new(self.address, da, self.name);
        self.outbox.push_back(claim.message());
    }

    pub fn change_address(&mut self, new_address: u8) {
        self.address = new_address;
        self.product_information.sa = new_address;
        self.configuration_information.sa = new_address;
        self.send_address_claim();
    }

    pub fn handle_iso_request(&mut self, request: &IsoRequest) {
        if request.da != self.address && request.da != 0xFF {
            return;
        }
        match request.request_pgn {
            PGN_ADDRESS_CLAIM => self.send_address_claim_response(request.sa),
            PGN_PRODUCT_INFORMATION => {
                self.product_information.sa = self.address;
                self.outbox.push_back(self.product_information.message());
            }
            PGN_CONFIGURATION_INFORMATION => {
                self.configuration_information.sa = self.address;
                self.outbox.push_back(self.configuration_information.message());
            }
            other => warn!(pgn = other, "ISO request for unsupported PGN"),
        }
    }

    pub fn handle_commanded_address(&mut self, request: &CommandedAddress) -> bool {
        if request.name != self.name {
            warn!("commanded address rejected: NAME mismatch");
            return false;
        }
        self.change_address(request.commanded_address);
        true
    }

    /// PGN 126208 Group Function. Only Command on configuration (126998) parameters is
    /// applied field by field; NAME (60928) fields are fixed at startup and always
    /// rejected; anything else is acknowledged as unsupported (spec §4.E).
    pub fn handle_group_function(&mut self, group_function: &GroupFunction) {
        let param_errors = if group_function.is_command() {
            match group_function.function_pgn {
                PGN_CONFIGURATION_INFORMATION => group_function
                    .parameters
                    .iter()
                    .map(|(field, value)| self.apply_configuration_parameter(*field, value))
                    .collect(),
                PGN_ADDRESS_CLAIM => vec![ParamError::Unsupported; group_function.parameters.len().max(1)],
                other => {
                    warn!(pgn = other, "command group function for unsupported PGN");
                    vec![ParamError::Unsupported]
                }
            }
        } else {
            vec![ParamError::Unsupported]
        };

        let mut ack = AcknowledgeGroupFunction::new(group_function.function_pgn, param_errors);
        ack.sa = self.address;
        ack.da = group_function.sa;
        self.outbox.push_back(ack.message());
    }

    /// Applies one `(field_number, value)` pair of a commanded PGN 126998 Configuration
    /// Information update: fields 1-3 are installation_1, installation_2 and
    /// manufacturer_info respectively, each a UTF-8 string up to 70 bytes.
    fn apply_configuration_parameter(&mut self, field: u8, value: &[u8]) -> ParamError {
        const MAX_LEN: usize = 70;
        if value.len() > MAX_LEN {
            return ParamError::OutOfRange;
        }
        let text = String::from_utf8_lossy(value).trim_end_matches('\0').to_string();
        match field {
            1 => {
                self.configuration_information.installation_1 = text;
                ParamError::Ok
            }
            2 => {
                self.configuration_information.installation_2 = text;
                ParamError::Ok
            }
            3 => {
                self.configuration_information.manufacturer_info = text;
                ParamError::Ok
            }
            _ => ParamError::Unsupported,
        }
    }

    pub const fn function_pgn_is_group_function(pgn: u32) -> bool {
        pgn == PGN_GROUP_FUNCTION
    }

    pub const fn pgn_is_commanded_address(pgn: u32) -> bool {
        pgn == PGN_COMMANDED_ADDRESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_activates_after_delay() {
        let mut pool = ApplicationPool::new("00:11:22:33:44:55", 999, 8, 128);
        let name = pool.next_name().unwrap();
        let mut app = NMEA2000Application::new(128, name);
        app.wait_for_bus_ready();
        assert_eq!(app.state, AppState::AddressClaim);
        app.poll_timers(Instant::now() + ADDRESS_CLAIM_DELAY + Duration::from_millis(1));
        assert_eq!(app.state, AppState::Active);
        let outgoing = app.drain_outbox();
        assert!(outgoing.iter().any(|m| m.pgn == 126993));
    }

    #[test]
    fn smaller_name_forces_address_change() {
        let mut pool = ApplicationPool::new("00:11:22:33:44:55", 999, 8, 128);
        let name = pool.next_name().unwrap();
        let mut app = NMEA2000Application::new(128, name);
        let smaller = Name(name.value().saturating_sub(1));
        let claim = AddressClaim::new(128, 0xFF, smaller);
        let change = app.handle_address_claim_conflict(&claim, &mut pool, &[128]);
        assert!(change.is_some());
    }
}
