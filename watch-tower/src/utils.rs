// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::WatchResult;
use crate::eth_client::ChainRpc;
use crate::types::{BlockHeader, RegistryBlock};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

/// 4-byte selector of `cabinet(address,bytes32)`, present in the dispatch
/// table of composable-order contracts.
static CABINET_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let hash = keccak256("cabinet(address,bytes32)");
    [hash[0], hash[1], hash[2], hash[3]]
});

/// Byte-code heuristic for "composable-compatible" contracts: deployed code
/// must be non-empty and embed the cabinet selector. An EOA or an unrelated
/// contract emitting a colliding topic fails this check.
pub async fn is_composable_compatible(rpc: &dyn ChainRpc, contract: Address) -> WatchResult<bool> {
    let code = rpc.code_at(contract).await?;
    Ok(!code.is_empty() && contains_selector(&code, &CABINET_SELECTOR))
}

fn contains_selector(code: &[u8], selector: &[u8; 4]) -> bool {
    code.windows(4).any(|window| window == selector)
}

/// Shortens a hash for log output
pub fn truncate_hash(hash: &H256) -> String {
    let hex = format!("{:#x}", hash);
    if hex.len() > 10 {
        format!("{}..", &hex[..10])
    } else {
        hex
    }
}

pub fn block_to_registry_block(header: &BlockHeader) -> RegistryBlock {
    RegistryBlock {
        number: header.number,
        hash: header.hash,
        timestamp: header.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_selector() {
        let selector = *CABINET_SELECTOR;
        let mut code = vec![0x60, 0x80, 0x60, 0x40];
        code.extend_from_slice(&selector);
        code.extend_from_slice(&[0x00, 0x01]);
        assert!(contains_selector(&code, &selector));
        assert!(!contains_selector(&[0u8; 16], &selector));
        assert!(!contains_selector(&[], &selector));
    }

    #[test]
    fn test_truncate_hash() {
        let truncated = truncate_hash(&H256::repeat_byte(0xab));
        assert_eq!(truncated, "0xabababab..");
    }
}
