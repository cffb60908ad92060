use lipchain_types::{Address, IpRange};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One seed allocation in the genesis dataset: the initial IP holdings of
/// a permissioned participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAlloc {
    pub address: Address,
    pub ranges: Vec<IpRange>,
    #[serde(default)]
    pub map_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub locator: Option<Ipv4Addr>,
}

impl GenesisAlloc {
    pub fn new(address: Address, ranges: Vec<IpRange>) -> Self {
        GenesisAlloc {
            address,
            ranges,
            map_server: None,
            locator: None,
        }
    }
}
