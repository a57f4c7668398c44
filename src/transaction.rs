use ethers::abi::{self, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, Signature, TransactionRequest, H256, U256,
};
use ethers::utils::id;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub id: u64,

    /// Set to true when the chain only accepts legacy transactions.
    pub is_legacy: bool,
}

impl Chain {
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            is_legacy: false,
        }
    }

    pub const fn legacy(id: u64) -> Self {
        Self {
            id,
            is_legacy: true,
        }
    }
}

/// A single contract invocation waiting to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub contract_address: Address,

    /// Function signature, e.g. `transfer(address,uint256)`.
    pub entry_point_selector: String,

    /// Call arguments, each encoded as one `uint256` word.
    pub calldata: Vec<U256>,
}

impl FunctionCall {
    pub fn new(
        contract_address: Address,
        entry_point_selector: impl Into<String>,
        calldata: Vec<U256>,
    ) -> Self {
        Self {
            contract_address,
            entry_point_selector: entry_point_selector.into(),
            calldata,
        }
    }

    pub fn selector(&self) -> [u8; 4] {
        id(&self.entry_point_selector)
    }

    /// Selector followed by the ABI-encoded calldata words.
    pub fn data(&self) -> Bytes {
        let tokens: Vec<Token> = self.calldata.iter().copied().map(Token::Uint).collect();
        let mut data = self.selector().to_vec();
        data.extend(abi::encode(&tokens));
        data.into()
    }

    /// Builds the unsigned transaction for this call. Gas and fees are left
    /// empty, to be filled by the chain client.
    pub fn to_transaction_request(&self, from: Address, chain: Chain, nonce: U256) -> TypedTransaction {
        if chain.is_legacy {
            TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(from)
                    .to(self.contract_address)
                    .data(self.data())
                    .nonce(nonce)
                    .chain_id(chain.id),
            )
        } else {
            TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(from)
                    .to(self.contract_address)
                    .data(self.data())
                    .nonce(nonce)
                    .chain_id(chain.id),
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub from: Address,
    pub nonce: U256,
    pub hash: H256,

    /// RLP encoding of the signed transaction, ready for `eth_sendRawTransaction`.
    pub raw: Bytes,

    pub call: FunctionCall,
}

impl SignedTransaction {
    pub fn new(
        call: FunctionCall,
        from: Address,
        nonce: U256,
        typed_transaction: &TypedTransaction,
        signature: &Signature,
    ) -> Self {
        Self {
            from,
            nonce,
            hash: typed_transaction.hash(signature),
            raw: typed_transaction.rlp_signed(signature),
            call,
        }
    }
}

/// Transactions of one account, in drain order, with consecutive nonces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedBatch {
    pub transactions: Vec<SignedTransaction>,
}

impl SignedBatch {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn push(&mut self, transaction: SignedTransaction) {
        self.transactions.push(transaction);
    }
}

impl<'a> IntoIterator for &'a SignedBatch {
    type Item = &'a SignedTransaction;
    type IntoIter = std::slice::Iter<'a, SignedTransaction>;

    fn into_iter(self) -> Self::IntoIter {
        self.transactions.iter()
    }
}
