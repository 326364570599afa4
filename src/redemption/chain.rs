//! Polygon settlement layer for claim redemption.
//!
//! Winning conditional-token positions are redeemed against the Gnosis
//! ConditionalTokens contract; each confirmed redemption pays out the
//! position's USDC.e collateral. The [`SettlementChain`] trait is the
//! seam that lets the redemption engine run against a mock in tests.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::RedemptionError;

/// Gnosis ConditionalTokens on Polygon.
pub const CONDITIONAL_TOKENS_POLYGON: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";
/// USDC.e collateral on Polygon.
pub const USDC_E_POLYGON: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";
/// Native balance below which no claim is attempted (0.005 POL).
pub const MIN_NATIVE_GAS_WEI: u128 = 5_000_000_000_000_000;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IConditionalTokens {
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] calldata indexSets
        ) external;

        event PayoutRedemption(
            address indexed redeemer,
            address indexed collateralToken,
            bytes32 indexed parentCollectionId,
            bytes32 conditionId,
            uint256[] indexSets,
            uint256 payout
        );
    }
}

/// Confirmation of one on-chain redemption.
#[derive(Debug, Clone)]
pub struct RedeemReceipt {
    /// Transaction hash of the confirmed redemption.
    pub tx_hash: String,
    /// Collateral paid out, summed over the receipt's
    /// `PayoutRedemption` events. `None` when no event decoded.
    pub payout_wei: Option<u128>,
}

/// The settlement chain the redemption engine talks to.
#[async_trait]
pub trait SettlementChain: Send + Sync {
    /// Native balance of the claiming wallet, in wei.
    async fn native_balance(&self) -> Result<u128, RedemptionError>;

    /// Redeem all index sets of a condition and wait for confirmation.
    async fn redeem(&self, condition_id: &str) -> Result<RedeemReceipt, RedemptionError>;
}

/// Real Polygon backend.
pub struct PolygonChain {
    rpc_url: String,
    private_key: String,
}

impl PolygonChain {
    /// Build a chain backend over the given RPC endpoint.
    pub fn new(rpc_url: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            private_key: private_key.into(),
        }
    }

    fn signer(&self) -> Result<PrivateKeySigner, RedemptionError> {
        self.private_key
            .parse()
            .map_err(|e| RedemptionError::InvalidId(format!("invalid private key: {}", e)))
    }

    fn rpc(&self) -> Result<reqwest::Url, RedemptionError> {
        self.rpc_url
            .parse()
            .map_err(|e| RedemptionError::InvalidId(format!("invalid RPC URL: {}", e)))
    }
}

/// Parse a condition id (with or without 0x prefix) into 32 bytes.
pub fn parse_condition_id(condition_id: &str) -> Result<[u8; 32], RedemptionError> {
    let trimmed = condition_id
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let bytes = hex::decode(trimmed)
        .map_err(|e| RedemptionError::InvalidId(format!("condition id not hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| RedemptionError::InvalidId("condition id must be 32 bytes".to_string()))
}

/// Split a chain error message along the retryability boundary.
///
/// Nonce conflicts, timeouts, and rate limits resolve themselves;
/// everything else is treated as fatal for this condition.
pub fn classify_chain_error(message: &str) -> RedemptionError {
    let lower = message.to_lowercase();
    let transient = ["nonce", "timeout", "timed out", "rate limit", "429", "connection", "temporarily"];
    if transient.iter().any(|needle| lower.contains(needle)) {
        RedemptionError::Retryable(message.to_string())
    } else {
        RedemptionError::Fatal(message.to_string())
    }
}

#[async_trait]
impl SettlementChain for PolygonChain {
    async fn native_balance(&self) -> Result<u128, RedemptionError> {
        let signer = self.signer()?;
        let provider = ProviderBuilder::new().connect_http(self.rpc()?);

        let balance = provider
            .get_balance(signer.address())
            .await
            .map_err(|e| classify_chain_error(&format!("balance read failed: {}", e)))?;

        debug!(address = %signer.address(), balance_wei = %balance, "native balance read");
        Ok(balance.to::<u128>())
    }

    async fn redeem(&self, condition_id: &str) -> Result<RedeemReceipt, RedemptionError> {
        let condition = parse_condition_id(condition_id)?;
        let signer = self.signer()?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(self.rpc()?);

        let contract_addr: Address = CONDITIONAL_TOKENS_POLYGON
            .parse()
            .map_err(|e| RedemptionError::InvalidId(format!("bad contract address: {}", e)))?;
        let collateral: Address = USDC_E_POLYGON
            .parse()
            .map_err(|e| RedemptionError::InvalidId(format!("bad collateral address: {}", e)))?;

        let contract = IConditionalTokens::new(contract_addr, provider);

        // binary market: index sets [1, 2] redeem both outcomes at once
        let call = contract.redeemPositions(
            collateral,
            [0u8; 32].into(),
            condition.into(),
            vec![U256::from(1), U256::from(2)],
        );

        let pending = call
            .send()
            .await
            .map_err(|e| classify_chain_error(&format!("redeem send failed: {}", e)))?;

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| classify_chain_error(&format!("redeem confirmation failed: {}", e)))?;

        let mut payout = U256::ZERO;
        let mut decoded_any = false;
        for log in receipt.logs() {
            if let Ok(event) = log.log_decode::<IConditionalTokens::PayoutRedemption>() {
                payout += event.inner.data.payout;
                decoded_any = true;
            }
        }
        let payout_wei = decoded_any.then(|| payout.to::<u128>());

        let tx_hash = format!("{:?}", receipt.transaction_hash);
        info!(
            condition_id = %condition_id,
            tx_hash = %tx_hash,
            payout_wei = ?payout_wei,
            "redemption confirmed"
        );
        Ok(RedeemReceipt { tx_hash, payout_wei })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn condition_id_parses_with_and_without_prefix() {
        let raw = "aa".repeat(32);
        let with_prefix = format!("0x{}", raw);

        assert_eq!(parse_condition_id(&raw).unwrap(), [0xaa; 32]);
        assert_eq!(parse_condition_id(&with_prefix).unwrap(), [0xaa; 32]);

        assert!(parse_condition_id("0x1234").is_err());
        assert!(parse_condition_id("not-hex").is_err());
    }

    #[test]
    fn transient_messages_classify_as_retryable() {
        assert!(classify_chain_error("nonce too low").is_retryable());
        assert!(classify_chain_error("request timed out").is_retryable());
        assert!(classify_chain_error("429 Too Many Requests").is_retryable());

        assert!(!classify_chain_error("execution reverted").is_retryable());
        assert!(!classify_chain_error("condition not resolved").is_retryable());
    }

    #[test]
    fn contract_addresses_are_checksummed_hex() {
        assert!(CONDITIONAL_TOKENS_POLYGON.parse::<Address>().is_ok());
        assert!(USDC_E_POLYGON.parse::<Address>().is_ok());
    }
}
