//! Pairing/bonding policy
//!
//! Applied once during bring-up, before the GATT app is registered and any
//! peer can connect.

use log::*;
use serde::{Deserialize, Serialize};

use crate::stack::{AuthReq, BleStack, EncryptionLevel, IoCap, KeyMask, SecurityParam};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub auth_req: AuthReq,
    pub io_cap: IoCap,
    pub max_key_size: u8,
    /// Keys the initiator distributes
    pub init_key: KeyMask,
    /// Keys the responder distributes
    pub rsp_key: KeyMask,
    /// Encryption requested from the peer right after it connects
    pub encryption: EncryptionLevel,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            auth_req: AuthReq::ScMitmBond,
            io_cap: IoCap::None,
            max_key_size: irk_proto::MAX_KEY_SIZE,
            init_key: KeyMask::ENC_ID,
            rsp_key: KeyMask::ENC_ID,
            encryption: EncryptionLevel::EncryptMitm,
        }
    }
}

impl SecurityPolicy {
    /// Plain bonding without MITM protection
    pub fn bond_only() -> Self {
        Self {
            auth_req: AuthReq::Bond,
            encryption: EncryptionLevel::EncryptNoMitm,
            ..Self::default()
        }
    }

    pub fn params(&self) -> [SecurityParam; 5] {
        [
            SecurityParam::AuthReq(self.auth_req),
            SecurityParam::IoCap(self.io_cap),
            SecurityParam::MaxKeySize(self.max_key_size),
            SecurityParam::InitKey(self.init_key),
            SecurityParam::RspKey(self.rsp_key),
        ]
    }

    /// Push every parameter to the stack. A rejected parameter leaves the
    /// stack default in place; bring-up carries on.
    ///
    /// Returns the number of parameters the stack rejected.
    pub fn apply<S: BleStack>(&self, stack: &S) -> usize {
        let mut failed = 0;
        for param in self.params() {
            if let Err(e) = stack.set_security_param(param) {
                error!("Failed to set security param {:?}: {}", param, e);
                failed += 1;
            }
        }

        if failed == 0 {
            info!(
                "BLE security parameters set: {:?}, io_cap {:?}, key size {}",
                self.auth_req, self.io_cap, self.max_key_size
            );
        } else {
            warn!("{} security parameter(s) rejected, stack defaults apply", failed);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Command, SimulatedStack};

    #[test]
    fn default_is_strongest() {
        let policy = SecurityPolicy::default();
        assert_eq!(policy.auth_req, AuthReq::ScMitmBond);
        assert_eq!(policy.io_cap, IoCap::None);
        assert_eq!(policy.max_key_size, 16);
        assert_eq!(policy.init_key, KeyMask { enc: true, id: true });
        assert_eq!(policy.rsp_key, KeyMask { enc: true, id: true });
        assert_eq!(policy.encryption, EncryptionLevel::EncryptMitm);
    }

    #[test]
    fn applies_all_params() {
        let stack = SimulatedStack::new();
        assert_eq!(SecurityPolicy::default().apply(&stack), 0);

        let params: Vec<SecurityParam> = stack
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::SetSecurityParam(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(params, SecurityPolicy::default().params().to_vec());
    }

    #[test]
    fn failures_are_counted_not_fatal() {
        let stack = SimulatedStack::new();
        stack.fail_command("set_security_param");
        assert_eq!(SecurityPolicy::bond_only().apply(&stack), 5);
    }
}
