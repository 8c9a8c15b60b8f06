//! Active Controller: CAN interface ownership, local application table, remote
//! device table, and dispatch of incoming `NMEA2000Msg`s (spec §4.F).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::application::{ApplicationPool, NMEA2000Application};
use crate::can_interface::CanWriter;
use crate::error::CanInterfaceError;
use crate::group_function::{AddressClaim, CommandedAddress, GroupFunction, IsoRequest, PGN_ADDRESS_CLAIM, PGN_COMMANDED_ADDRESS, PGN_GROUP_FUNCTION, PGN_ISO_REQUEST};
use crate::message::NMEA2000Msg;
use crate::name::Name;
use crate::pgn::pgn_for_controller;

#[derive(Default)]
struct PendingAddressChange {
    old_address: u8,
    new_address: u8,
}

/// Owns the CAN interface, the set of locally hosted applications (by address), the
/// remote device table, and the two dispatch maps described in spec §4.F.
pub struct ActiveController {
    writer: Option<CanWriter>,
    applications: HashMap<u8, NMEA2000Application>,
    pool: ApplicationPool,
    remote_devices: HashMap<u8, Name>,
    pgn_vector: HashMap<u32, u8>,
    catch_all: Vec<u8>,
    pending_change: Option<PendingAddressChange>,
}

impl ActiveController {
    pub fn new(pool: ApplicationPool) -> Self {
        ActiveController {
            writer: None,
            applications: HashMap::new(),
            pool,
            remote_devices: HashMap::new(),
            pgn_vector: HashMap::new(),
            catch_all: Vec::new(),
            pending_change: None,
        }
    }

    pub fn attach_writer(&mut self, writer: CanWriter) {
        self.writer = Some(writer);
    }

    pub fn local_addresses(&self) -> HashSet<u8> {
        self.applications.keys().copied().collect()
    }

    pub fn add_application(&mut self, app: NMEA2000Application) {
        self.applications.insert(app.address, app);
    }

    /// Subscribe an application to a data PGN, or to the catch-all list with `pgn = -1`
    /// encoded as `None` (spec §4.F "set_pgn_vector").
    pub fn subscribe_pgn(&mut self, address: u8, pgn: Option<u32>) {
        match pgn {
            Some(pgn) => {
                if self.pgn_vector.insert(pgn, address).is_some() {
                    warn!(pgn, "duplicate PGN subscription ignored");
                }
            }
            None => self.catch_all.push(address),
        }
    }

    pub async fn send(&self, msg: &NMEA2000Msg, force: bool) -> Result<(), CanInterfaceError> {
        let Some(writer) = &self.writer else {
            return Err(CanInterfaceError::Fatal("CAN writer not attached".into()));
        };
        let can_claimed = !self.applications.is_empty();
        if !can_claimed && !force {
            return Err(CanInterfaceError::NotClaimed);
        }
        writer.send(msg.build_arbitration_id(), msg.payload.clone()).await
    }

    /// Start address claim for every hosted application (spec §4.F "start_applications",
    /// simplified: applications are started together rather than serialized by a lock
    /// since each claim already self-paces on its own 400ms timer).
    pub fn start_applications(&mut self) -> Vec<NMEA2000Msg> {
        let mut outgoing = Vec::new();
        for app in self.applications.values_mut() {
            app.wait_for_bus_ready();
            outgoing.extend(app.drain_outbox());
        }
        outgoing
    }

    pub fn poll_timers(&mut self, now: Instant) -> Vec<NMEA2000Msg> {
        let mut outgoing = Vec::new();
        for app in self.applications.values_mut() {
            app.poll_timers(now);
            outgoing.extend(app.drain_outbox());
        }
        outgoing
    }

    pub fn stop(&mut self) {
        for app in self.applications.values_mut() {
            app.stop_request();
        }
    }

    /// Dispatch one received message per the table in spec §4.F. Returns any messages
    /// the dispatch produced (address-claim responses, acknowledgements, ...).
    pub fn dispatch(&mut self, msg: NMEA2000Msg) -> Vec<NMEA2000Msg> {
        let mut outgoing = Vec::new();
        let is_iso = pgn_for_controller(msg.pgn);

        if msg.da != 0xFF {
            if !self.applications.contains_key(&msg.da) {
                error!(da = msg.da, pgn = msg.pgn, "message routed to unknown local address, dropping");
                return outgoing;
            }
            if is_iso {
                self.dispatch_iso_to(msg.da, &msg, &mut outgoing);
            } else if let Some(app) = self.applications.get_mut(&msg.da) {
                app.receive_data_msg(msg);
                outgoing.extend(app.drain_outbox());
            }
            return outgoing;
        }

        if is_iso {
            if msg.pgn == PGN_ADDRESS_CLAIM {
                if let Some(claim) = AddressClaim::from_message(&msg) {
                    self.remote_devices.insert(claim.sa, claim.name);
                }
            }
            self.broadcast_iso(&msg, &mut outgoing);
            if let Some(change) = self.pending_change.take() {
                self.apply_address_change(change);
            }
        } else {
            if let Some(&address) = self.pgn_vector.get(&msg.pgn) {
                if let Some(app) = self.applications.get_mut(&address) {
                    app.receive_data_msg(msg.clone());
                    outgoing.extend(app.drain_outbox());
                }
            }
            for &address in &self.catch_all.clone() {
                if let Some(app) = self.applications.get_mut(&address) {
                    app.receive_data_msg(msg.clone());
                    outgoing.extend(app.drain_outbox());
                }
            }
        }

        outgoing
    }

    fn dispatch_iso_to(&mut self, address: u8, msg: &NMEA2000Msg, outgoing: &mut Vec<NMEA2000Msg>) {
        match msg.pgn {
            PGN_ISO_REQUEST => {
                if let Some(request) = IsoRequest::from_message(msg) {
                    if let Some(app) = self.applications.get_mut(&address) {
                        app.handle_iso_request(&request);
                        outgoing.extend(app.drain_outbox());
                    }
                }
            }
            PGN_GROUP_FUNCTION => {
                if let Some(group_function) = GroupFunction::from_message(msg) {
                    if let Some(app) = self.applications.get_mut(&address) {
                        app.handle_group_function(&group_function);
                        outgoing.extend(app.drain_outbox());
                    }
                }
            }
            other => debug!(pgn = other, address, "no handler for addressed ISO message"),
        }
    }

    fn broadcast_iso(&mut self, msg: &NMEA2000Msg, outgoing: &mut Vec<NMEA2000Msg>) {
        let taken: Vec<u8> = self.applications.keys().copied().collect();
        match msg.pgn {
            PGN_ADDRESS_CLAIM => {
                if let Some(claim) = AddressClaim::from_message(msg) {
                    self.resolve_address_conflicts(&claim, outgoing);
                }
            }
            PGN_COMMANDED_ADDRESS => {
                if let Some(request) = CommandedAddress::from_message(msg) {
                    for app in self.applications.values_mut() {
                        if app.name == request.name {
                            app.change_address(request.commanded_address);
                            outgoing.extend(app.drain_outbox());
                        }
                    }
                }
            }
            PGN_ISO_REQUEST => {
                if let Some(request) = IsoRequest::from_message(msg) {
                    for app in self.applications.values_mut() {
                        app.handle_iso_request(&request);
                        outgoing.extend(app.drain_outbox());
                    }
                }
            }
            other => debug!(pgn = other, "no broadcast handler registered"),
        }
        let _ = taken;
    }

    fn resolve_address_conflicts(&mut self, claim: &AddressClaim, outgoing: &mut Vec<NMEA2000Msg>) {
        let taken: Vec<u8> = self.applications.keys().copied().collect();
        let Some(app) = self.applications.get_mut(&claim.sa) else { return };
        if let Some(new_address) = app.handle_address_claim_conflict(claim, &mut self.pool, &taken) {
            outgoing.extend(app.drain_outbox());
            if new_address == 254 {
                self.stop();
                return;
            }
            let old_address = claim.sa;
            self.pending_change = Some(PendingAddressChange { old_address, new_address });
        } else {
            outgoing.extend(app.drain_outbox());
        }
    }

    fn apply_address_change(&mut self, change: PendingAddressChange) {
        if let Some(mut app) = self.applications.remove(&change.old_address) {
            app.change_address(change.new_address);
            self.applications.insert(change.new_address, app);
        }
    }
}
