//! Archiver payloads to domain records.
//!
//! Hex-encoded input and signature fields are recoded to standard base64;
//! byte fields of tick data are base64 encoded as-is.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::archiver::{ArchivedComputors, ArchivedTickData, ArchivedTransaction};
use crate::model::{EpochComputors, TickData, TickTransactions, Tx};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("field {field} is not valid hex: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
}

/// Recodes a hex string to base64. Empty input stays empty.
pub fn hex_to_base64(field: &'static str, value: &str) -> Result<String, ConvertError> {
    let bytes = hex::decode(value).map_err(|source| ConvertError::Hex { field, source })?;
    Ok(STANDARD.encode(bytes))
}

pub fn transaction(archived: &ArchivedTransaction) -> Result<Tx, ConvertError> {
    let body = &archived.transaction;
    Ok(Tx {
        hash: body.tx_id.clone(),
        source: body.source_id.clone(),
        destination: body.dest_id.clone(),
        amount: body.amount,
        tick_number: body.tick_number,
        input_type: body.input_type,
        input_size: body.input_size,
        input_data: hex_to_base64("inputHex", &body.input_hex)?,
        signature: hex_to_base64("signatureHex", &body.signature_hex)?,
        timestamp: archived.timestamp,
        money_flew: archived.money_flew,
    })
}

/// Builds the per-tick record; the epoch comes from the planned range.
pub fn tick_transactions(
    epoch: u32,
    tick_number: u32,
    archived: &[ArchivedTransaction],
) -> Result<TickTransactions, ConvertError> {
    let transactions = archived
        .iter()
        .map(transaction)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TickTransactions {
        epoch,
        tick_number,
        transactions,
    })
}

pub fn tick_data(archived: &ArchivedTickData) -> Result<TickData, ConvertError> {
    Ok(TickData {
        computor_index: archived.computor_index,
        epoch: archived.epoch,
        tick_number: archived.tick_number,
        timestamp: archived.timestamp,
        var_struct: STANDARD.encode(&archived.var_struct),
        time_lock: STANDARD.encode(&archived.time_lock),
        transaction_hashes: archived.transaction_ids.clone(),
        contract_fees: archived.contract_fees.clone(),
        signature: hex_to_base64("signatureHex", &archived.signature_hex)?,
    })
}

/// `fallback_tick` is used when the archiver does not report the tick the list was published at.
pub fn epoch_computors(
    archived: &ArchivedComputors,
    fallback_tick: u32,
) -> Result<EpochComputors, ConvertError> {
    let tick_number = if archived.tick_number > 0 {
        archived.tick_number
    } else {
        fallback_tick
    };
    Ok(EpochComputors {
        epoch: archived.epoch,
        tick_number,
        identities: archived.identities.clone(),
        signature: hex_to_base64("signatureHex", &archived.signature_hex)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::ArchivedTransactionBody;

    #[test]
    fn hex_to_base64_is_bit_exact() {
        assert_eq!(hex_to_base64("f", "").unwrap(), "");
        assert_eq!(hex_to_base64("f", "00").unwrap(), "AA==");
        assert_eq!(hex_to_base64("f", "deadbeef").unwrap(), "3q2+7w==");
        assert_eq!(hex_to_base64("f", "DEADBEEF").unwrap(), "3q2+7w==");
        assert!(hex_to_base64("f", "0g").is_err());
        assert!(hex_to_base64("f", "abc").is_err());
    }

    #[test]
    fn transaction_maps_fields() {
        let archived = ArchivedTransaction {
            transaction: ArchivedTransactionBody {
                source_id: "SRC".into(),
                dest_id: "DST".into(),
                amount: 10,
                tick_number: 15,
                input_type: 2,
                input_size: 1,
                input_hex: "ff".into(),
                signature_hex: "0102".into(),
                tx_id: "txid".into(),
            },
            timestamp: 99,
            money_flew: false,
        };
        let t = tick_transactions(100, 15, &[archived]).unwrap();
        assert_eq!(t.epoch, 100);
        assert_eq!(t.tick_number, 15);
        let tx = &t.transactions[0];
        assert_eq!(tx.hash, "txid");
        assert_eq!(tx.source, "SRC");
        assert_eq!(tx.destination, "DST");
        assert_eq!(tx.input_data, "/w==");
        assert_eq!(tx.signature, "AQI=");
        assert_eq!(tx.timestamp, 99);
    }

    #[test]
    fn tick_data_encodes_bytes() {
        let archived = ArchivedTickData {
            computor_index: 1,
            epoch: 100,
            tick_number: 7,
            timestamp: 3,
            var_struct: vec![1, 2],
            time_lock: vec![],
            transaction_ids: vec!["a".into()],
            contract_fees: vec![5],
            signature_hex: "ff".into(),
        };
        let td = tick_data(&archived).unwrap();
        assert_eq!(td.var_struct, "AQI=");
        assert_eq!(td.time_lock, "");
        assert_eq!(td.signature, "/w==");
        assert_eq!(td.transaction_hashes, vec!["a".to_string()]);
    }

    #[test]
    fn computors_fall_back_to_epoch_start_tick() {
        let archived = ArchivedComputors {
            epoch: 100,
            tick_number: 0,
            identities: vec!["ID".into()],
            signature_hex: "00".into(),
        };
        assert_eq!(epoch_computors(&archived, 10000000).unwrap().tick_number, 10000000);
        let with_tick = ArchivedComputors {
            tick_number: 10000005,
            ..archived
        };
        assert_eq!(epoch_computors(&with_tick, 10000000).unwrap().tick_number, 10000005);
    }
}
