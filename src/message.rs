// Inbound peer messages and their dispatch onto the ledger

use crate::error::LedgerError;
use crate::ledger::{ShardedLedger, SubmitOutcome};
use log::debug;
use qfc_core::{Block, ShardId, Transaction};
use serde::{Deserialize, Serialize};

/// `{"type": ..., "payload": ...}` as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    Transaction(Transaction),
    Block { shard_id: ShardId, block: Block },
    SyncRequest { shard_id: ShardId, from_index: u64 },
}

impl InboundMessage {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    TransactionAccepted(SubmitOutcome),
    BlockAccepted { shard_id: ShardId, index: u64 },
    SyncResponse { shard_id: ShardId, blocks: Vec<Block> },
}

impl ShardedLedger {
    pub fn handle_message(&self, message: InboundMessage) -> Result<OutboundMessage, LedgerError> {
        match message {
            InboundMessage::Transaction(tx) => {
                let outcome = self.submit_transaction(tx)?;
                Ok(OutboundMessage::TransactionAccepted(outcome))
            }
            InboundMessage::Block { shard_id, block } => {
                let index = block.index;
                self.receive_block(shard_id, block)?;
                Ok(OutboundMessage::BlockAccepted { shard_id, index })
            }
            InboundMessage::SyncRequest { shard_id, from_index } => {
                let blocks = self.blocks_from(shard_id, from_index)?;
                debug!("[{}] Serving {} blocks from #{}", shard_id, blocks.len(), from_index);
                Ok(OutboundMessage::SyncResponse { shard_id, blocks })
            }
        }
    }
}
