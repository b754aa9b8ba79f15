// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use sha2::Digest;
use tpm_states::{
    OrderlyData, OrderlyState, ShutdownMode, StateClearData, StateResetData,
};

/// Measurement-register banks plus the bookkeeping that has to survive
/// a warm resume.
pub struct PcrBank {
    bank0: [u8; 32],
    bank1: [u8; 32],
    bank2: [u8; 32],
    auth_values: [u8; 32],
    update_counter: u32,
}

impl PcrBank {
    pub fn new() -> PcrBank {
        PcrBank {
            bank0: [0; 32],
            bank1: [0; 32],
            bank2: [0; 32],
            auth_values: [0; 32],
            update_counter: 0,
        }
    }

    fn bank_mut(&mut self, bank: usize) -> &mut [u8; 32] {
        match bank {
            0 => &mut self.bank0,
            1 => &mut self.bank1,
            _ => &mut self.bank2,
        }
    }

    /// Fold a measurement into a bank: new = H(old || data)
    pub fn extend(&mut self, bank: usize, data: &[u8]) {
        let slot = self.bank_mut(bank);
        let mut sha = sha2::Sha256::new();
        sha.update(&slot[..]);
        sha.update(data);
        *slot = sha.finalize().into();
        self.update_counter += 1;
    }

    pub fn set_auth_values(&mut self, auth: [u8; 32]) {
        self.auth_values = auth;
    }

    pub fn update_counter(&self) -> u32 {
        self.update_counter
    }

    /// Capture private measurement state into the resume page. Bank
    /// contents only matter if the session is coming back; a clear
    /// shutdown leaves the saved area zeroed.
    pub fn state_save(&self, mode: ShutdownMode, clear: &mut StateClearData) {
        match mode {
            ShutdownMode::State => {
                clear.pcr_save0 = self.bank0;
                clear.pcr_save1 = self.bank1;
                clear.pcr_save2 = self.bank2;
                clear.pcr_auth_values = self.auth_values;
            }
            ShutdownMode::Clear => {
                clear.pcr_save0 = [0; 32];
                clear.pcr_save1 = [0; 32];
                clear.pcr_save2 = [0; 32];
                clear.pcr_auth_values = [0; 32];
            }
        }
    }
}

impl Default for PcrBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Auxiliary countdown timers. Remaining timeouts are preserved for a
/// warm resume and dropped on a clear shutdown.
pub struct ActTimers {
    timeout: [u32; 4],
    signaled: u8,
}

impl ActTimers {
    pub fn new() -> ActTimers {
        ActTimers {
            timeout: [0; 4],
            signaled: 0,
        }
    }

    pub fn set_timeout(&mut self, idx: usize, seconds: u32) {
        self.timeout[idx & 3] = seconds;
    }

    pub fn signal(&mut self, idx: usize) {
        self.signaled |= 1 << (idx & 3);
    }

    pub fn shutdown_save(&self, mode: ShutdownMode, data: &mut OrderlyData) {
        match mode {
            ShutdownMode::State => {
                data.act_timeout0 = self.timeout[0];
                data.act_timeout1 = self.timeout[1];
                data.act_timeout2 = self.timeout[2];
                data.act_timeout3 = self.timeout[3];
                data.act_signaled = self.signaled;
            }
            ShutdownMode::Clear => {
                data.act_timeout0 = 0;
                data.act_timeout1 = 0;
                data.act_timeout2 = 0;
                data.act_timeout3 = 0;
                data.act_signaled = 0;
            }
        }
    }
}

impl Default for ActTimers {
    fn default() -> Self {
        Self::new()
    }
}

/// RAM image of the index-backed data that rides the always-saved page
/// as a digest.
pub struct IndexOrderlyRam {
    data: Vec<u8>,
}

impl IndexOrderlyRam {
    pub fn new() -> IndexOrderlyRam {
        IndexOrderlyRam { data: Vec::new() }
    }

    pub fn set(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn update_orderly_data(&self, orderly: &mut OrderlyData) {
        let mut sha = sha2::Sha256::new();
        sha.update(&self.data);
        orderly.index_digest = sha.finalize().into();
    }
}

impl Default for IndexOrderlyRam {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the shutdown path reads or mutates, gathered in one
/// place: the in-memory images of the persistent pages, the volatile
/// session flags, and the sub-state owners whose capture routines the
/// committer relies on.
pub struct StateContext {
    /// In-memory image of the persisted recovery decision value
    pub orderly_state: OrderlyState,

    /// An anti-hammering-relevant authorization attempt happened since
    /// the last clean shutdown
    pub da_used: bool,

    /// The measurement bank layout changed this session; a warm-resume
    /// shutdown is off the table until the next full startup
    pub pcr_reconfigured: bool,

    /// A pre-startup measurement sequence was recorded this session
    pub drtm_pre_startup: bool,

    /// The session began at locality 3
    pub startup_locality3: bool,

    /// Accumulated session timer
    pub time: u64,

    pub orderly_data: OrderlyData,
    pub state_clear: StateClearData,
    pub state_reset: StateResetData,

    pub pcr: PcrBank,
    pub act: ActTimers,
    pub index_ram: IndexOrderlyRam,
}

impl StateContext {
    /// Power-on defaults: nothing recorded, nothing orderly.
    pub fn new() -> StateContext {
        StateContext {
            orderly_state: OrderlyState::None,
            da_used: false,
            pcr_reconfigured: false,
            drtm_pre_startup: false,
            startup_locality3: false,
            time: 0,
            orderly_data: OrderlyData::new(),
            state_clear: StateClearData::new(),
            state_reset: StateResetData::new(),
            pcr: PcrBank::new(),
            act: ActTimers::new(),
            index_ram: IndexOrderlyRam::new(),
        }
    }
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_changes_bank_and_counter() {
        let mut pcr = PcrBank::new();
        assert_eq!(pcr.update_counter(), 0);

        pcr.extend(0, b"first measurement");
        assert_eq!(pcr.update_counter(), 1);
        assert_ne!(pcr.bank0, [0; 32]);

        let after_one = pcr.bank0;
        pcr.extend(0, b"second measurement");
        assert_ne!(pcr.bank0, after_one);
    }

    #[test]
    fn clear_save_zeroes_the_bank_area() {
        let mut pcr = PcrBank::new();
        pcr.extend(1, b"data");

        let mut page = StateClearData::new();
        pcr.state_save(ShutdownMode::State, &mut page);
        assert_ne!(page.pcr_save1, [0; 32]);

        pcr.state_save(ShutdownMode::Clear, &mut page);
        assert_eq!(page.pcr_save1, [0; 32]);
    }

    #[test]
    fn act_save_drops_timeouts_on_clear() {
        let mut act = ActTimers::new();
        act.set_timeout(0, 300);
        act.set_timeout(3, 60);
        act.signal(3);

        let mut page = OrderlyData::new();
        act.shutdown_save(ShutdownMode::State, &mut page);
        assert_eq!(page.act_timeout0, 300);
        assert_eq!(page.act_timeout3, 60);
        assert_eq!(page.act_signaled, 0b1000);

        act.shutdown_save(ShutdownMode::Clear, &mut page);
        assert_eq!(page.act_timeout0, 0);
        assert_eq!(page.act_signaled, 0);
    }

    #[test]
    fn index_digest_tracks_ram_contents() {
        let mut ram = IndexOrderlyRam::new();
        let mut page = OrderlyData::new();

        ram.update_orderly_data(&mut page);
        let empty = page.index_digest;

        ram.set(vec![1, 2, 3]);
        ram.update_orderly_data(&mut page);
        assert_ne!(page.index_digest, empty);
    }
}
