//! Lightning payment handling over Nostr Wallet Connect.
//!
//! Providers may interrupt an execution with a `payment-required`
//! notification carrying a bolt11 invoice; the executor hands the invoice to
//! the configured [`InvoicePayer`] and keeps waiting for the final response.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::nips::nip47::{NostrWalletConnectURI, PayInvoiceRequest};
use nwc::NWC;

use crate::error::{Error, Result};

/// Upper bound on a single invoice payment.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pays bolt11 invoices. The production implementation speaks NWC; tests
/// substitute their own.
#[async_trait]
pub trait InvoicePayer: Send + Sync {
    /// Pay the invoice and return the preimage.
    async fn pay(&self, invoice: &str) -> Result<String>;
}

/// NWC-backed payer built from a `nostr+walletconnect://` connection string.
pub struct NwcPayer {
    nwc: NWC,
}

impl NwcPayer {
    pub fn from_connection_string(uri: &str) -> Result<Self> {
        let uri = NostrWalletConnectURI::from_str(uri)
            .map_err(|e| Error::Config(format!("invalid NWC connection string: {e}")))?;
        Ok(Self { nwc: NWC::new(uri) })
    }
}

#[async_trait]
impl InvoicePayer for NwcPayer {
    async fn pay(&self, invoice: &str) -> Result<String> {
        let request = PayInvoiceRequest {
            id: None,
            invoice: invoice.to_string(),
            amount: None,
        };
        let response = tokio::time::timeout(PAYMENT_TIMEOUT, self.nwc.pay_invoice(request))
            .await
            .map_err(|_| Error::Payment("invoice payment timed out".to_string()))?
            .map_err(|e| Error::Payment(format!("wallet rejected payment: {e}")))?;
        Ok(response.preimage)
    }
}
