//! In-memory chain for dry runs and tests.
//!
//! [`SimulatedChain`] mines one block per transaction, plus an empty block
//! every time its head is polled so confirmation depths are reached while a
//! waiter polls. It models just enough
//! contract behaviour for a deployment to run end to end: every contract is
//! an ERC-20 token with OpenZeppelin-style access control, and the AMM
//! router, factory and pairs follow the Uniswap V2 interface. Calls to
//! functions it does not know are accepted and recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};
use anyhow::Result;

use super::{ChainClient, Receipt, TransactionRequest};
use crate::abi::{self, AbiValue, selector};
use crate::spec::DeploymentSpec;

/// Token balance credited to the deployer of every simulated contract (1e27).
pub const DEFAULT_GENESIS_SUPPLY: U256 = U256::from_limbs([0x9fd0803ce8000000, 0x33b2e3c, 0, 0]);

/// Timestamp of the first simulated block.
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Seconds between simulated blocks.
const BLOCK_TIME: u64 = 12;

/// Functions with built-in behaviour.
const KNOWN_SIGNATURES: &[&str] = &[
    "transfer(address,uint256)",
    "approve(address,uint256)",
    "transferFrom(address,address,uint256)",
    "deposit()",
    "grantRole(bytes32,address)",
    "revokeRole(bytes32,address)",
    "renounceRole(bytes32,address)",
    "addLiquidity(address,address,uint256,uint256,uint256,uint256,address,uint256)",
    "createPair(address,address)",
    "balanceOf(address)",
    "allowance(address,address)",
    "totalSupply()",
    "decimals()",
    "hasRole(bytes32,address)",
    "factory()",
    "WETH()",
    "getPair(address,address)",
    "token0()",
    "token1()",
    "getReserves()",
];

static SIGNATURES: LazyLock<HashMap<[u8; 4], &'static str>> = LazyLock::new(|| {
    KNOWN_SIGNATURES
        .iter()
        .map(|sig| (selector(sig), *sig))
        .collect()
});

#[derive(Debug, Clone)]
enum ContractKind {
    Token,
    Router {
        factory: Address,
        weth: Option<Address>,
    },
    Factory {
        pairs: BTreeMap<(Address, Address), Address>,
    },
    Pair {
        token0: Address,
        token1: Address,
    },
}

#[derive(Debug, Clone)]
struct Contract {
    kind: ContractKind,
    code: Bytes,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    total_supply: U256,
    roles: HashSet<(B256, Address)>,
    /// Selectors of unknown functions that were successfully called.
    applied: HashSet<[u8; 4]>,
    /// View selector → setter selector; the view returns `true` once the setter ran.
    flags: HashMap<[u8; 4], [u8; 4]>,
}

impl Contract {
    fn new(kind: ContractKind, code: Bytes) -> Self {
        Self {
            kind,
            code,
            balances: HashMap::new(),
            allowances: HashMap::new(),
            total_supply: U256::ZERO,
            roles: HashSet::new(),
            applied: HashSet::new(),
            flags: HashMap::new(),
        }
    }

    fn balance(&self, holder: Address) -> U256 {
        self.balances.get(&holder).copied().unwrap_or_default()
    }

    fn mint(&mut self, to: Address, amount: U256) {
        *self.balances.entry(to).or_default() += amount;
        self.total_supply += amount;
    }

    fn move_balance(&mut self, from: Address, to: Address, amount: U256) -> Result<(), String> {
        let balance = self.balance(from);
        if balance < amount {
            return Err("ERC20: transfer amount exceeds balance".to_string());
        }
        self.balances.insert(from, balance - amount);
        *self.balances.entry(to).or_default() += amount;
        Ok(())
    }

    fn has_role(&self, role: B256, account: Address) -> bool {
        self.roles.contains(&(role, account))
    }
}

#[derive(Debug, Clone)]
struct State {
    chain_id: u64,
    block_number: u64,
    timestamp: u64,
    genesis_supply: U256,
    nonces: HashMap<Address, u64>,
    native: HashMap<Address, U256>,
    contracts: HashMap<Address, Contract>,
    receipts: HashMap<B256, Receipt>,
    withheld: HashMap<B256, Receipt>,
    withhold: bool,
    reverts: HashSet<(Address, [u8; 4])>,
    transactions: Vec<TransactionRequest>,
}

/// Decoded arguments of a call.
struct Args<'a>(&'a [u8]);

impl Args<'_> {
    fn uint(&self, index: usize) -> Result<U256, String> {
        abi::word(self.0, index)
            .map(U256::from_be_slice)
            .map_err(|e| e.to_string())
    }

    fn address(&self, index: usize) -> Result<Address, String> {
        abi::word(self.0, index)
            .map(|w| Address::from_slice(&w[12..]))
            .map_err(|e| e.to_string())
    }

    fn bytes32(&self, index: usize) -> Result<B256, String> {
        abi::word(self.0, index)
            .map(B256::from_slice)
            .map_err(|e| e.to_string())
    }
}

fn pair_address(factory: Address, token0: Address, token1: Address) -> Address {
    let mut preimage = Vec::with_capacity(60);
    preimage.extend_from_slice(factory.as_slice());
    preimage.extend_from_slice(token0.as_slice());
    preimage.extend_from_slice(token1.as_slice());
    Address::from_slice(&keccak256(preimage)[12..])
}

fn sort_tokens(a: Address, b: Address) -> (Address, Address) {
    if a < b { (a, b) } else { (b, a) }
}

impl State {
    fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            block_number: 0,
            timestamp: GENESIS_TIMESTAMP,
            genesis_supply: DEFAULT_GENESIS_SUPPLY,
            nonces: HashMap::new(),
            native: HashMap::new(),
            contracts: HashMap::new(),
            receipts: HashMap::new(),
            withheld: HashMap::new(),
            withhold: false,
            reverts: HashSet::new(),
            transactions: Vec::new(),
        }
    }

    fn mine(&mut self) {
        self.block_number += 1;
        self.timestamp += BLOCK_TIME;
    }

    fn nonce(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or_default()
    }

    fn contract_mut(&mut self, address: Address) -> Result<&mut Contract, String> {
        self.contracts
            .get_mut(&address)
            .ok_or_else(|| format!("no contract at {}", address))
    }

    fn transfer_from(
        &mut self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), String> {
        let contract = self.contract_mut(token)?;
        let allowance = contract
            .allowances
            .get(&(from, spender))
            .copied()
            .unwrap_or_default();
        if allowance < amount {
            return Err("ERC20: insufficient allowance".to_string());
        }
        if allowance != U256::MAX {
            contract.allowances.insert((from, spender), allowance - amount);
        }
        contract.move_balance(from, to, amount)
    }

    fn get_or_create_pair(&mut self, factory: Address, a: Address, b: Address) -> Result<Address, String> {
        let (token0, token1) = sort_tokens(a, b);
        let address = pair_address(factory, token0, token1);
        match &mut self.contract_mut(factory)?.kind {
            ContractKind::Factory { pairs } => {
                pairs.entry((token0, token1)).or_insert(address);
            }
            _ => return Err(format!("{} is not a factory", factory)),
        }
        self.contracts
            .entry(address)
            .or_insert_with(|| Contract::new(ContractKind::Pair { token0, token1 }, Bytes::new()));
        Ok(address)
    }

    /// Run a transaction against the state. On error nothing may be committed.
    fn execute(&mut self, tx: &TransactionRequest) -> Result<Option<Address>, String> {
        let destination = tx.to.unwrap_or_else(|| create_address(tx.from, tx.nonce));

        if !tx.value.is_zero() {
            let balance = self.native.get(&tx.from).copied().unwrap_or_default();
            if balance < tx.value {
                return Err("insufficient native balance".to_string());
            }
            self.native.insert(tx.from, balance - tx.value);
            *self.native.entry(destination).or_default() += tx.value;
        }

        let Some(to) = tx.to else {
            let mut contract = Contract::new(ContractKind::Token, tx.data.clone());
            contract.mint(tx.from, self.genesis_supply);
            contract.roles.insert((B256::ZERO, tx.from));
            self.contracts.insert(destination, contract);
            return Ok(Some(destination));
        };

        if tx.data.len() < 4 || !self.contracts.contains_key(&to) {
            return Ok(None);
        }

        let sel: [u8; 4] = [tx.data[0], tx.data[1], tx.data[2], tx.data[3]];
        if self.reverts.contains(&(to, sel)) {
            return Err("execution reverted".to_string());
        }

        let args = Args(&tx.data[4..]);
        let sender = tx.from;
        match SIGNATURES.get(&sel).copied() {
            Some("transfer(address,uint256)") => {
                let (recipient, amount) = (args.address(0)?, args.uint(1)?);
                self.contract_mut(to)?.move_balance(sender, recipient, amount)?;
            }
            Some("approve(address,uint256)") => {
                let (spender, amount) = (args.address(0)?, args.uint(1)?);
                self.contract_mut(to)?
                    .allowances
                    .insert((sender, spender), amount);
            }
            Some("transferFrom(address,address,uint256)") => {
                let (from, recipient, amount) = (args.address(0)?, args.address(1)?, args.uint(2)?);
                self.transfer_from(to, sender, from, recipient, amount)?;
            }
            Some("deposit()") => {
                self.contract_mut(to)?.mint(sender, tx.value);
            }
            Some("grantRole(bytes32,address)") => {
                let (role, account) = (args.bytes32(0)?, args.address(1)?);
                let contract = self.contract_mut(to)?;
                if !contract.has_role(B256::ZERO, sender) {
                    return Err(format!("AccessControl: account {} is missing role", sender));
                }
                contract.roles.insert((role, account));
            }
            Some("revokeRole(bytes32,address)") => {
                let (role, account) = (args.bytes32(0)?, args.address(1)?);
                let contract = self.contract_mut(to)?;
                if !contract.has_role(B256::ZERO, sender) {
                    return Err(format!("AccessControl: account {} is missing role", sender));
                }
                contract.roles.remove(&(role, account));
            }
            Some("renounceRole(bytes32,address)") => {
                let (role, account) = (args.bytes32(0)?, args.address(1)?);
                if account != sender {
                    return Err("AccessControl: can only renounce roles for self".to_string());
                }
                self.contract_mut(to)?.roles.remove(&(role, account));
            }
            Some("createPair(address,address)") => {
                let factory = to;
                self.get_or_create_pair(factory, args.address(0)?, args.address(1)?)?;
            }
            Some("addLiquidity(address,address,uint256,uint256,uint256,uint256,address,uint256)") => {
                self.add_liquidity(to, sender, &args)?;
            }
            _ => {
                self.contract_mut(to)?.applied.insert(sel);
            }
        }

        Ok(None)
    }

    fn add_liquidity(&mut self, router: Address, sender: Address, args: &Args<'_>) -> Result<(), String> {
        let token_a = args.address(0)?;
        let token_b = args.address(1)?;
        let (amount_a, amount_b) = (args.uint(2)?, args.uint(3)?);
        let (min_a, min_b) = (args.uint(4)?, args.uint(5)?);
        let recipient = args.address(6)?;
        let deadline = args.uint(7)?;

        if deadline < U256::from(self.timestamp) {
            return Err("UniswapV2Router: EXPIRED".to_string());
        }
        if amount_a < min_a || amount_b < min_b {
            return Err("UniswapV2Router: INSUFFICIENT_AMOUNT".to_string());
        }

        let factory = match &self.contract_mut(router)?.kind {
            ContractKind::Router { factory, .. } => *factory,
            _ => return Err(format!("{} is not a router", router)),
        };

        let pair = self.get_or_create_pair(factory, token_a, token_b)?;
        self.transfer_from(token_a, router, sender, pair, amount_a)?;
        self.transfer_from(token_b, router, sender, pair, amount_b)?;

        let liquidity = amount_a.saturating_mul(amount_b).root(2);
        if liquidity.is_zero() {
            return Err("UniswapV2: INSUFFICIENT_LIQUIDITY_MINTED".to_string());
        }
        self.contract_mut(pair)?.mint(recipient, liquidity);
        Ok(())
    }

    fn view(&self, to: Address, data: &[u8]) -> Result<Bytes, String> {
        let Some(contract) = self.contracts.get(&to) else {
            return Ok(Bytes::new());
        };
        if data.len() < 4 {
            return Ok(Bytes::new());
        }

        let sel: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if self.reverts.contains(&(to, sel)) {
            return Err("execution reverted".to_string());
        }

        let args = Args(&data[4..]);
        let value = match (SIGNATURES.get(&sel).copied(), &contract.kind) {
            (Some("balanceOf(address)"), _) => vec![AbiValue::Uint(contract.balance(args.address(0)?))],
            (Some("allowance(address,address)"), _) => {
                let key = (args.address(0)?, args.address(1)?);
                vec![AbiValue::Uint(
                    contract.allowances.get(&key).copied().unwrap_or_default(),
                )]
            }
            (Some("totalSupply()"), _) => vec![AbiValue::Uint(contract.total_supply)],
            (Some("decimals()"), _) => vec![AbiValue::Uint(U256::from(18))],
            (Some("hasRole(bytes32,address)"), _) => vec![AbiValue::Bool(
                contract.has_role(args.bytes32(0)?, args.address(1)?),
            )],
            (Some("factory()"), ContractKind::Router { factory, .. }) => {
                vec![AbiValue::Address(*factory)]
            }
            (Some("WETH()"), ContractKind::Router { weth, .. }) => {
                vec![AbiValue::Address(weth.unwrap_or_default())]
            }
            (Some("getPair(address,address)"), ContractKind::Factory { pairs }) => {
                let key = sort_tokens(args.address(0)?, args.address(1)?);
                vec![AbiValue::Address(pairs.get(&key).copied().unwrap_or_default())]
            }
            (Some("token0()"), ContractKind::Pair { token0, .. }) => vec![AbiValue::Address(*token0)],
            (Some("token1()"), ContractKind::Pair { token1, .. }) => vec![AbiValue::Address(*token1)],
            (Some("getReserves()"), ContractKind::Pair { token0, token1 }) => {
                let reserve = |token: &Address| {
                    self.contracts
                        .get(token)
                        .map(|c| c.balance(to))
                        .unwrap_or_default()
                };
                vec![
                    AbiValue::Uint(reserve(token0)),
                    AbiValue::Uint(reserve(token1)),
                    AbiValue::Uint(U256::from(self.timestamp)),
                ]
            }
            _ => match contract.flags.get(&sel) {
                Some(setter) => vec![AbiValue::Bool(contract.applied.contains(setter))],
                None => vec![AbiValue::Uint(U256::ZERO)],
            },
        };

        Ok(abi::encode(&value).into())
    }
}

/// Address of a contract created by `sender` at `nonce`.
fn create_address(sender: Address, nonce: u64) -> Address {
    let mut preimage = Vec::with_capacity(28);
    preimage.extend_from_slice(sender.as_slice());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    Address::from_slice(&keccak256(preimage)[12..])
}

/// An in-memory chain. Cloning yields another handle to the same chain.
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<State>>,
}

impl SimulatedChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new(chain_id))),
        }
    }

    /// A chain pre-populated with everything a deployment file expects to exist.
    ///
    /// The AMM router and factory are installed at their configured
    /// addresses; every other entry of `[addresses]` becomes a token holding
    /// the genesis supply for the deployer, who is also funded with native
    /// currency.
    pub fn from_spec(spec: &DeploymentSpec) -> Self {
        let chain = Self::new(spec.network.chain_id);
        let deployer = spec.network.deployer;

        let amm = spec.amm.as_ref().and_then(|amm| {
            let router = *spec.addresses.get(&amm.router)?;
            let factory = amm
                .factory
                .as_ref()
                .and_then(|name| spec.addresses.get(name).copied())
                .unwrap_or_else(|| create_address(router, 0));
            Some((router, factory))
        });

        if let Some((router, factory)) = amm {
            chain.install_amm(router, factory, None);
        }

        for address in spec.addresses.values() {
            if amm.is_some_and(|(r, f)| *address == r || *address == f) {
                continue;
            }
            chain.install_token(*address, deployer, DEFAULT_GENESIS_SUPPLY);
        }

        chain.fund(deployer, DEFAULT_GENESIS_SUPPLY);
        chain
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Credit native currency.
    pub fn fund(&self, address: Address, amount: U256) {
        *self.state().native.entry(address).or_default() += amount;
    }

    /// Install a token at a fixed address, minting `amount` to `holder`.
    pub fn install_token(&self, address: Address, holder: Address, amount: U256) {
        let mut contract = Contract::new(ContractKind::Token, Bytes::new());
        contract.mint(holder, amount);
        self.state().contracts.insert(address, contract);
    }

    /// Install a Uniswap V2 style router and its factory.
    pub fn install_amm(&self, router: Address, factory: Address, weth: Option<Address>) {
        let mut state = self.state();
        state.contracts.insert(
            router,
            Contract::new(ContractKind::Router { factory, weth }, Bytes::new()),
        );
        state.contracts.insert(
            factory,
            Contract::new(
                ContractKind::Factory {
                    pairs: BTreeMap::new(),
                },
                Bytes::new(),
            ),
        );
    }

    /// Make every call to `signature` on `address` revert.
    pub fn revert_on(&self, address: Address, signature: &str) {
        self.state().reverts.insert((address, selector(signature)));
    }

    /// Undo [`SimulatedChain::revert_on`].
    pub fn stop_reverting(&self, address: Address, signature: &str) {
        self.state().reverts.remove(&(address, selector(signature)));
    }

    /// Make the view `view` on `address` return `true` once `setter` has been called.
    pub fn link_flag(&self, address: Address, view: &str, setter: &str) {
        if let Some(contract) = self.state().contracts.get_mut(&address) {
            contract.flags.insert(selector(view), selector(setter));
        }
    }

    /// Stop (or resume) publishing receipts. Withheld receipts are published on resume.
    pub fn withhold_receipts(&self, withhold: bool) {
        let mut state = self.state();
        state.withhold = withhold;
        if !withhold {
            let released: Vec<_> = state.withheld.drain().collect();
            state.receipts.extend(released);
        }
    }

    /// Move the clock forward.
    pub fn advance_time(&self, seconds: u64) {
        self.state().timestamp += seconds;
    }

    /// Force the transaction count of an account, as if it sent transactions elsewhere.
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Tokens per simulated contract deployment credited to the deployer.
    pub fn set_genesis_supply(&self, amount: U256) {
        self.state().genesis_supply = amount;
    }

    pub fn balance_of(&self, token: Address, holder: Address) -> U256 {
        self.state()
            .contracts
            .get(&token)
            .map(|c| c.balance(holder))
            .unwrap_or_default()
    }

    pub fn native_balance(&self, address: Address) -> U256 {
        self.state().native.get(&address).copied().unwrap_or_default()
    }

    pub fn has_role(&self, contract: Address, role: B256, account: Address) -> bool {
        self.state()
            .contracts
            .get(&contract)
            .is_some_and(|c| c.has_role(role, account))
    }

    /// Address of the pair for two tokens, if the factory created one.
    pub fn pair(&self, factory: Address, a: Address, b: Address) -> Option<Address> {
        match &self.state().contracts.get(&factory)?.kind {
            ContractKind::Factory { pairs } => pairs.get(&sort_tokens(a, b)).copied(),
            _ => None,
        }
    }

    /// Creation code (bytecode and constructor arguments) a contract was deployed with.
    pub fn creation_code(&self, address: Address) -> Option<Bytes> {
        self.state().contracts.get(&address).map(|c| c.code.clone())
    }

    /// Whether a function without built-in behaviour has been called on a contract.
    pub fn was_called(&self, address: Address, signature: &str) -> bool {
        self.state()
            .contracts
            .get(&address)
            .is_some_and(|c| c.applied.contains(&selector(signature)))
    }

    /// Every transaction included so far, in order.
    pub fn transactions(&self) -> Vec<TransactionRequest> {
        self.state().transactions.clone()
    }

    /// Nonce of an account, without going through the async client interface.
    pub fn account_nonce(&self, address: Address) -> u64 {
        self.state().nonce(address)
    }
}

impl ChainClient for SimulatedChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.state().chain_id)
    }

    async fn nonce(&self, address: Address) -> Result<u64> {
        Ok(self.state().nonce(address))
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<B256> {
        let mut state = self.state();

        let expected = state.nonce(tx.from);
        if tx.nonce != expected {
            anyhow::bail!(
                "nonce {} rejected for {}: next nonce is {}",
                tx.nonce,
                tx.from,
                expected
            );
        }
        if state.native.get(&tx.from).copied().unwrap_or_default() < tx.value {
            anyhow::bail!("insufficient funds for value transfer from {}", tx.from);
        }

        let mut preimage = Vec::with_capacity(36);
        preimage.extend_from_slice(tx.from.as_slice());
        preimage.extend_from_slice(&tx.nonce.to_be_bytes());
        preimage.extend_from_slice(&state.chain_id.to_be_bytes());
        let tx_hash = keccak256(preimage);

        state.mine();

        let mut next = state.clone();
        let (status, contract_address) = match next.execute(tx) {
            Ok(created) => {
                *state = next;
                (true, created)
            }
            Err(reason) => {
                tracing::debug!(%tx_hash, %reason, "Simulated transaction reverted");
                (false, None)
            }
        };

        state.nonces.insert(tx.from, tx.nonce + 1);
        state.transactions.push(tx.clone());

        let receipt = Receipt {
            tx_hash,
            block_number: state.block_number,
            status,
            contract_address,
        };
        if state.withhold {
            state.withheld.insert(tx_hash, receipt);
        } else {
            state.receipts.insert(tx_hash, receipt);
        }

        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64> {
        let mut state = self.state();
        state.mine();
        Ok(state.block_number)
    }

    async fn block_timestamp(&self) -> Result<u64> {
        Ok(self.state().timestamp)
    }

    async fn call(&self, to: Address, data: &Bytes) -> Result<Bytes> {
        self.state()
            .view(to, data)
            .map_err(|reason| anyhow::anyhow!("call to {} reverted: {}", to, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{decode_address, decode_bool, decode_uint, encode_call};

    fn deployer() -> Address {
        Address::repeat_byte(0xde)
    }

    fn tx(chain: &SimulatedChain, to: Option<Address>, data: Bytes) -> TransactionRequest {
        TransactionRequest {
            from: deployer(),
            to,
            data,
            value: U256::ZERO,
            nonce: chain.account_nonce(deployer()),
        }
    }

    async fn send(chain: &SimulatedChain, to: Option<Address>, data: Bytes) -> Receipt {
        let request = tx(chain, to, data);
        let hash = chain.send_transaction(&request).await.unwrap();
        chain.receipt(hash).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_creation_mints_supply_and_grants_admin() {
        let chain = SimulatedChain::new(1);
        let receipt = send(&chain, None, Bytes::from_static(&[0x60, 0x80])).await;

        assert!(receipt.status);
        let token = receipt.contract_address.unwrap();
        assert_eq!(token, create_address(deployer(), 0));
        assert_eq!(chain.balance_of(token, deployer()), DEFAULT_GENESIS_SUPPLY);
        assert!(chain.has_role(token, B256::ZERO, deployer()));
        assert_eq!(chain.account_nonce(deployer()), 1);
        assert_eq!(receipt.block_number, 1);
    }

    #[tokio::test]
    async fn test_head_advances_when_polled() {
        let chain = SimulatedChain::new(1);
        let receipt = send(&chain, None, Bytes::new()).await;
        let before = chain.block_timestamp().await.unwrap();

        assert_eq!(chain.block_number().await.unwrap(), receipt.block_number + 1);
        assert_eq!(chain.block_number().await.unwrap(), receipt.block_number + 2);
        assert_eq!(chain.block_timestamp().await.unwrap(), before + 2 * BLOCK_TIME);
    }

    #[tokio::test]
    async fn test_wrong_nonce_is_rejected() {
        let chain = SimulatedChain::new(1);
        let mut request = tx(&chain, None, Bytes::new());
        request.nonce = 5;

        assert!(chain.send_transaction(&request).await.is_err());
        assert_eq!(chain.account_nonce(deployer()), 0);
    }

    #[tokio::test]
    async fn test_revert_rolls_back_but_consumes_nonce() {
        let chain = SimulatedChain::new(1);
        let token = send(&chain, None, Bytes::new()).await.contract_address.unwrap();
        let other = Address::repeat_byte(0x22);

        chain.revert_on(token, "transfer(address,uint256)");
        let data = encode_call(
            "transfer(address,uint256)",
            &[AbiValue::Address(other), AbiValue::Uint(U256::from(5))],
        );
        let receipt = send(&chain, Some(token), data).await;

        assert!(!receipt.status);
        assert_eq!(chain.balance_of(token, other), U256::ZERO);
        assert_eq!(chain.account_nonce(deployer()), 2);
    }

    #[tokio::test]
    async fn test_add_liquidity_creates_pair() {
        let chain = SimulatedChain::new(1);
        let router = Address::repeat_byte(0x01);
        let factory = Address::repeat_byte(0x02);
        chain.install_amm(router, factory, None);

        let a = send(&chain, None, Bytes::new()).await.contract_address.unwrap();
        let b = send(&chain, None, Bytes::new()).await.contract_address.unwrap();
        let amount = U256::from(1_000_000u64);
        for token in [a, b] {
            let approve = encode_call(
                "approve(address,uint256)",
                &[AbiValue::Address(router), AbiValue::Uint(amount)],
            );
            assert!(send(&chain, Some(token), approve).await.status);
        }

        let deadline = chain.block_timestamp().await.unwrap() + 600;
        let add = encode_call(
            "addLiquidity(address,address,uint256,uint256,uint256,uint256,address,uint256)",
            &[
                AbiValue::Address(a),
                AbiValue::Address(b),
                AbiValue::Uint(amount),
                AbiValue::Uint(amount),
                AbiValue::Uint(amount),
                AbiValue::Uint(amount),
                AbiValue::Address(deployer()),
                AbiValue::Uint(U256::from(deadline)),
            ],
        );
        assert!(send(&chain, Some(router), add).await.status);

        let pair = chain.pair(factory, b, a).unwrap();
        assert_eq!(chain.balance_of(a, pair), amount);
        assert_eq!(chain.balance_of(pair, deployer()), amount);

        let get_pair = encode_call(
            "getPair(address,address)",
            &[AbiValue::Address(a), AbiValue::Address(b)],
        );
        let out = chain.call(factory, &get_pair).await.unwrap();
        assert_eq!(decode_address(&out).unwrap(), pair);
    }

    #[tokio::test]
    async fn test_grant_role_requires_admin() {
        let chain = SimulatedChain::new(1);
        let token = send(&chain, None, Bytes::new()).await.contract_address.unwrap();
        let admin = Address::repeat_byte(0xad);
        let grant = encode_call(
            "grantRole(bytes32,address)",
            &[AbiValue::Bytes32(B256::ZERO), AbiValue::Address(admin)],
        );
        assert!(send(&chain, Some(token), grant.clone()).await.status);

        let has_role = encode_call(
            "hasRole(bytes32,address)",
            &[AbiValue::Bytes32(B256::ZERO), AbiValue::Address(admin)],
        );
        assert!(decode_bool(&chain.call(token, &has_role).await.unwrap()).unwrap());

        let renounce = encode_call(
            "renounceRole(bytes32,address)",
            &[AbiValue::Bytes32(B256::ZERO), AbiValue::Address(deployer())],
        );
        assert!(send(&chain, Some(token), renounce).await.status);
        assert!(!send(&chain, Some(token), grant).await.status);
    }

    #[tokio::test]
    async fn test_linked_flag_and_unknown_calls() {
        let chain = SimulatedChain::new(1);
        let token = send(&chain, None, Bytes::new()).await.contract_address.unwrap();
        chain.link_flag(token, "votingEnabled()", "toggleVotes()");

        let view = encode_call("votingEnabled()", &[]);
        assert!(!decode_bool(&chain.call(token, &view).await.unwrap()).unwrap());

        assert!(send(&chain, Some(token), encode_call("toggleVotes()", &[])).await.status);
        assert!(decode_bool(&chain.call(token, &view).await.unwrap()).unwrap());
        assert!(chain.was_called(token, "toggleVotes()"));

        let unknown = encode_call("mintingFee()", &[]);
        assert_eq!(decode_uint(&chain.call(token, &unknown).await.unwrap()).unwrap(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_withheld_receipts() {
        let chain = SimulatedChain::new(1);
        chain.withhold_receipts(true);
        let request = tx(&chain, None, Bytes::new());
        let hash = chain.send_transaction(&request).await.unwrap();
        assert!(chain.receipt(hash).await.unwrap().is_none());

        chain.withhold_receipts(false);
        assert!(chain.receipt(hash).await.unwrap().is_some());
    }
}
