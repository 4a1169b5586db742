//! Domain records published to Kafka and indexed downstream.
//!
//! Field names follow the canonical JSON contract shared with the indexer
//! (camelCase, optional tick-data fields omitted when empty). Every record also
//! knows its Kafka key and its downstream document id, so at-least-once
//! publication plus upsert-by-id indexing stays idempotent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Epoch value the archiver reports for tick data that was never initialized.
pub const UNINITIALIZED_EPOCH: u32 = 65535;

/// True for epochs that may appear on an emitted record (neither 0 nor 65535).
pub fn is_valid_epoch(epoch: u32) -> bool {
    epoch != 0 && epoch != UNINITIALIZED_EPOCH
}

/// Kafka record key for tick- and epoch-indexed streams: little-endian u32.
pub fn u32_key(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid epoch {epoch} for tick {tick}")]
    Epoch { epoch: u32, tick: u32 },
    #[error("invalid tick number 0 in epoch {epoch}")]
    Tick { epoch: u32 },
    #[error("invalid interval in epoch {epoch}: from {from} > to {to}")]
    Interval { epoch: u32, from: u32, to: u32 },
    #[error("transaction in tick {tick} has no hash")]
    MissingHash { tick: u32 },
}

/// One transaction, with input and signature recoded from hex to base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub hash: String,
    pub source: String,
    pub destination: String,
    pub amount: i64,
    pub tick_number: u32,
    pub input_type: u32,
    pub input_size: u32,
    pub input_data: String,
    pub signature: String,
    pub timestamp: u64,
    pub money_flew: bool,
}

/// All transactions of one tick. An empty tick carries `transactions: []`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickTransactions {
    pub epoch: u32,
    pub tick_number: u32,
    pub transactions: Vec<Tx>,
}

impl TickTransactions {
    pub fn empty(epoch: u32, tick_number: u32) -> Self {
        Self {
            epoch,
            tick_number,
            transactions: Vec::new(),
        }
    }

    pub fn kafka_key(&self) -> [u8; 4] {
        u32_key(self.tick_number)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_epoch(self.epoch) {
            return Err(ValidationError::Epoch {
                epoch: self.epoch,
                tick: self.tick_number,
            });
        }
        if self.tick_number == 0 {
            return Err(ValidationError::Tick { epoch: self.epoch });
        }
        if self.transactions.iter().any(|tx| tx.hash.is_empty()) {
            return Err(ValidationError::MissingHash {
                tick: self.tick_number,
            });
        }
        Ok(())
    }
}

/// Tick metadata. Binary fields are base64; empty optional fields are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickData {
    pub computor_index: u32,
    pub epoch: u32,
    pub tick_number: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub var_struct: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time_lock: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transaction_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_fees: Vec<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl TickData {
    pub fn kafka_key(&self) -> [u8; 4] {
        u32_key(self.tick_number)
    }

    pub fn document_id(&self) -> String {
        self.tick_number.to_string()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_epoch(self.epoch) {
            return Err(ValidationError::Epoch {
                epoch: self.epoch,
                tick: self.tick_number,
            });
        }
        if self.tick_number == 0 {
            return Err(ValidationError::Tick { epoch: self.epoch });
        }
        Ok(())
    }
}

/// Computor identities of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochComputors {
    pub epoch: u32,
    pub tick_number: u32,
    pub identities: Vec<String>,
    pub signature: String,
}

impl EpochComputors {
    pub fn kafka_key(&self) -> [u8; 4] {
        u32_key(self.epoch)
    }

    pub fn document_id(&self) -> String {
        self.epoch.to_string()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_epoch(self.epoch) {
            return Err(ValidationError::Epoch {
                epoch: self.epoch,
                tick: self.tick_number,
            });
        }
        Ok(())
    }
}

/// A finalized processed interval `[from, to]` of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TickInterval {
    pub epoch: u32,
    pub from: u32,
    pub to: u32,
}

impl TickInterval {
    pub fn new(epoch: u32, from: u32, to: u32) -> Self {
        Self { epoch, from, to }
    }

    pub fn kafka_key(&self) -> [u8; 4] {
        u32_key(self.epoch)
    }

    /// `"{epoch}-{from}"`: `(epoch, from)` identifies an interval over time.
    pub fn document_id(&self) -> String {
        format!("{}-{}", self.epoch, self.from)
    }

    pub fn contains(&self, tick: u32) -> bool {
        self.from <= tick && tick <= self.to
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_epoch(self.epoch) {
            return Err(ValidationError::Epoch {
                epoch: self.epoch,
                tick: self.from,
            });
        }
        if self.from == 0 {
            return Err(ValidationError::Tick { epoch: self.epoch });
        }
        if self.from > self.to {
            return Err(ValidationError::Interval {
                epoch: self.epoch,
                from: self.from,
                to: self.to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx() -> Tx {
        Tx {
            hash: "hash".into(),
            source: "src".into(),
            destination: "dst".into(),
            amount: 42,
            tick_number: 7,
            input_type: 1,
            input_size: 2,
            input_data: "AAE=".into(),
            signature: "Ag==".into(),
            timestamp: 1700000000000,
            money_flew: true,
        }
    }

    #[test]
    fn tx_json_field_names() {
        let v = serde_json::to_value(tx()).unwrap();
        assert_eq!(
            v,
            json!({
                "hash": "hash",
                "source": "src",
                "destination": "dst",
                "amount": 42,
                "tickNumber": 7,
                "inputType": 1,
                "inputSize": 2,
                "inputData": "AAE=",
                "signature": "Ag==",
                "timestamp": 1700000000000u64,
                "moneyFlew": true
            })
        );
    }

    #[test]
    fn tick_data_omits_empty_optionals() {
        let td = TickData {
            computor_index: 3,
            epoch: 100,
            tick_number: 10,
            timestamp: 5,
            var_struct: String::new(),
            time_lock: String::new(),
            transaction_hashes: vec![],
            contract_fees: vec![],
            signature: String::new(),
        };
        let v = serde_json::to_value(&td).unwrap();
        assert_eq!(
            v,
            json!({"computorIndex": 3, "epoch": 100, "tickNumber": 10, "timestamp": 5})
        );
        let back: TickData = serde_json::from_value(v).unwrap();
        assert_eq!(back, td);
    }

    #[test]
    fn sentinel_epochs_are_invalid() {
        assert!(!is_valid_epoch(0));
        assert!(!is_valid_epoch(UNINITIALIZED_EPOCH));
        assert!(is_valid_epoch(1));
        assert!(is_valid_epoch(65534));
    }

    #[test]
    fn keys_are_little_endian() {
        let t = TickTransactions::empty(100, 0x0102_0304);
        assert_eq!(t.kafka_key(), [0x04, 0x03, 0x02, 0x01]);
        let c = EpochComputors {
            epoch: 1,
            tick_number: 1,
            identities: vec![],
            signature: String::new(),
        };
        assert_eq!(c.kafka_key(), [1, 0, 0, 0]);
    }

    #[test]
    fn interval_document_id_and_validation() {
        let i = TickInterval::new(1, 2, 8);
        assert_eq!(i.document_id(), "1-2");
        assert!(i.validate().is_ok());
        assert!(i.contains(2) && i.contains(8) && !i.contains(9));
        assert_eq!(
            TickInterval::new(1, 9, 8).validate(),
            Err(ValidationError::Interval { epoch: 1, from: 9, to: 8 })
        );
    }

    #[test]
    fn tick_transactions_validation() {
        assert!(TickTransactions::empty(100, 1).validate().is_ok());
        assert_eq!(
            TickTransactions::empty(100, 0).validate(),
            Err(ValidationError::Tick { epoch: 100 })
        );
        let mut t = TickTransactions::empty(100, 7);
        let mut bad = tx();
        bad.hash.clear();
        t.transactions.push(bad);
        assert_eq!(t.validate(), Err(ValidationError::MissingHash { tick: 7 }));
    }
}
