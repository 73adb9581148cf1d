//! Emergency close gateway: lets a single owner force-close a batch of a
//! counterparty's positions, but only on markets whose symbol has been
//! invalidated by the market authority.

#![deny(unsafe_code)]

use solana_program::pubkey::Pubkey;

// 1. mod constants
pub mod constants {
    use core::mem::size_of;
    use crate::state::GatewayHeader;

    pub const MAGIC: u64 = 0x454d47434c4f5345; // "EMGCLOSE"
    pub const VERSION: u32 = 1;

    pub const CONFIG_LEN: usize = size_of::<GatewayHeader>();

    pub const SELECTOR_LEN: usize = 4;
    /// Selector of the counterparty's `emergencyClosePosition(positionId)`.
    pub const SELECTOR_EMERGENCY_CLOSE: [u8; SELECTOR_LEN] = [0xa3, 0x03, 0x94, 0x31];
    pub const POSITION_ID_LEN: usize = 8;
    pub const EMERGENCY_CLOSE_ENTRY_LEN: usize = SELECTOR_LEN + POSITION_ID_LEN;

    pub const GATEWAY_SEED: &[u8] = b"gateway";
    pub const POSITION_SEED: &[u8] = b"position";
    pub const SYMBOL_SEED: &[u8] = b"symbol";
    pub const EMERGENCY_SEED: &[u8] = b"emergency";

    pub const POSITION_MAGIC: u64 = 0x504f534954494f4e; // "POSITION"
    pub const SYMBOL_MAGIC: u64 = 0x53594d424f4c535f; // "SYMBOLS_"
    pub const EMERGENCY_MAGIC: u64 = 0x454d4552474e4359; // "EMERGNCY"

    /// Market authority instruction tag for `setPartyBEmergencyStatus`.
    pub const SET_EMERGENCY_STATUS_TAG: u8 = 12;
}

// 2. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;

    #[derive(Clone, Debug, Eq, Error, FromPrimitive, PartialEq)]
    pub enum GatewayError {
        #[error("Ownable: caller is not the owner")]
        NotOwner,
        #[error("EmergencyClose: PartyB is already in emergency status")]
        AlreadyInEmergency,
        #[error("EmergencyClose: Invalid call data")]
        InvalidCallData,
        #[error("EmergencyClose: Only emergencyClosePosition is allowed")]
        SelectorNotAllowed,
        #[error("EmergencyClose: Symbol is still valid")]
        SymbolStillValid,
        #[error("EmergencyClose: Counterparty rejected the call")]
        DispatchFailed,
        #[error("Position not found")]
        PositionNotFound,
        #[error("Symbol not found")]
        SymbolNotFound,
        #[error("Unsupported gateway version")]
        InvalidVersion,
        #[error("Gateway already initialized")]
        AlreadyInitialized,
        #[error("Gateway not initialized")]
        NotInitialized,
        #[error("Invalid gateway config length")]
        InvalidConfigLen,
        #[error("Expected signer")]
        ExpectedSigner,
        #[error("Expected writable")]
        ExpectedWritable,
    }

    impl From<GatewayError> for ProgramError {
        fn from(e: GatewayError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for GatewayError {
        fn type_of() -> &'static str {
            "GatewayError"
        }
    }

    impl PrintProgramError for GatewayError {
        fn print<E>(&self)
        where
            E: 'static
                + std::error::Error
                + DecodeError<E>
                + PrintProgramError
                + num_traits::FromPrimitive,
        {
            msg!("{}", self);
        }
    }
}

// 3. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{
        instruction::{AccountMeta, Instruction as SolInstruction},
        program_error::ProgramError,
        pubkey::Pubkey,
    };
    use crate::{accounts, market};

    pub const TAG_INIT_GATEWAY: u8 = 0;
    pub const TAG_EMERGENCY_CLOSE_POSITIONS: u8 = 1;

    const ENTRY_LEN_PREFIX: usize = 4;

    #[derive(Debug, Eq, PartialEq)]
    pub enum Instruction {
        InitGateway {
            owner: Pubkey,
            counterparty: Pubkey,
            market_authority: Pubkey,
        },
        EmergencyClosePositions { entries: Vec<Vec<u8>> },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            let instruction = match tag {
                TAG_INIT_GATEWAY => {
                    let owner = read_pubkey(&mut rest)?;
                    let counterparty = read_pubkey(&mut rest)?;
                    let market_authority = read_pubkey(&mut rest)?;
                    Instruction::InitGateway { owner, counterparty, market_authority }
                }
                TAG_EMERGENCY_CLOSE_POSITIONS => {
                    let count = read_u16(&mut rest)? as usize;
                    // every entry carries at least its length prefix
                    if count * ENTRY_LEN_PREFIX > rest.len() {
                        return Err(ProgramError::InvalidInstructionData);
                    }
                    let mut entries = Vec::with_capacity(count);
                    for _ in 0..count {
                        let len = read_u32(&mut rest)? as usize;
                        entries.push(read_bytes(&mut rest, len)?.to_vec());
                    }
                    Instruction::EmergencyClosePositions { entries }
                }
                _ => return Err(ProgramError::InvalidInstructionData),
            };

            if !rest.is_empty() {
                return Err(ProgramError::InvalidInstructionData);
            }
            Ok(instruction)
        }

        pub fn encode(&self) -> Vec<u8> {
            match self {
                Instruction::InitGateway { owner, counterparty, market_authority } => {
                    let mut data = Vec::with_capacity(1 + 3 * 32);
                    data.push(TAG_INIT_GATEWAY);
                    data.extend_from_slice(owner.as_ref());
                    data.extend_from_slice(counterparty.as_ref());
                    data.extend_from_slice(market_authority.as_ref());
                    data
                }
                Instruction::EmergencyClosePositions { entries } => {
                    let body: usize = entries.iter().map(|e| ENTRY_LEN_PREFIX + e.len()).sum();
                    let mut data = Vec::with_capacity(3 + body);
                    data.push(TAG_EMERGENCY_CLOSE_POSITIONS);
                    data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                    for entry in entries {
                        data.extend_from_slice(&(entry.len() as u32).to_le_bytes());
                        data.extend_from_slice(entry);
                    }
                    data
                }
            }
        }
    }

    /// Builds `InitGateway`. `config` must already be allocated with
    /// `CONFIG_LEN` bytes and assigned to `program_id`.
    pub fn init_gateway(
        program_id: &Pubkey,
        payer: &Pubkey,
        config: &Pubkey,
        owner: Pubkey,
        counterparty: Pubkey,
        market_authority: Pubkey,
    ) -> SolInstruction {
        SolInstruction {
            program_id: *program_id,
            accounts: vec![AccountMeta::new_readonly(*payer, true), AccountMeta::new(*config, false)],
            data: Instruction::InitGateway { owner, counterparty, market_authority }.encode(),
        }
    }

    /// Builds `EmergencyClosePositions`. `records` are the position and
    /// symbol accounts the batch touches plus anything the counterparty
    /// needs for the close; they are forwarded to it untouched.
    pub fn emergency_close_positions(
        program_id: &Pubkey,
        owner: &Pubkey,
        config: &Pubkey,
        counterparty: &Pubkey,
        market_authority: &Pubkey,
        records: &[AccountMeta],
        entries: Vec<Vec<u8>>,
    ) -> SolInstruction {
        let (authority, _) = accounts::derive_gateway_authority(program_id, config);
        let (status, _) = market::emergency_status_address(market_authority, counterparty);

        let mut metas = vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new_readonly(*config, false),
            AccountMeta::new_readonly(authority, false),
            AccountMeta::new_readonly(*market_authority, false),
            AccountMeta::new_readonly(*counterparty, false),
            AccountMeta::new(status, false),
        ];
        metas.extend_from_slice(records);

        SolInstruction {
            program_id: *program_id,
            accounts: metas,
            data: Instruction::EmergencyClosePositions { entries }.encode(),
        }
    }

    fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        let bytes = read_bytes(input, 2)?;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        let bytes = read_bytes(input, 4)?;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        let bytes = read_bytes(input, 32)?;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }
}

// 4. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::{constants::GATEWAY_SEED, error::GatewayError};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(GatewayError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(GatewayError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// The PDA that signs the gateway's calls into the market authority and
    /// the counterparty.
    pub fn derive_gateway_authority(program_id: &Pubkey, config_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[GATEWAY_SEED, config_key.as_ref()], program_id)
    }

    pub fn gateway_authority_address(program_id: &Pubkey, config_key: &Pubkey, bump: u8) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::create_program_address(&[GATEWAY_SEED, config_key.as_ref(), &[bump]], program_id)?)
    }
}

// 5. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::{constants::{CONFIG_LEN, MAGIC, VERSION}, error::GatewayError};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct GatewayHeader {
        pub magic: u64,
        pub version: u32,
        pub authority_bump: u8,
        pub _padding: [u8; 3],
        pub owner: [u8; 32],
        pub counterparty: [u8; 32],
        pub market_authority: [u8; 32],
        pub _reserved: [u8; 16],
    }

    /// Deployment-time wiring. Fixed once `InitGateway` has run.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GatewayConfig {
        pub owner: Pubkey,
        pub counterparty: Pubkey,
        pub market_authority: Pubkey,
        pub authority_bump: u8,
    }

    pub fn read_header(data: &[u8]) -> Result<GatewayHeader, ProgramError> {
        if data.len() < CONFIG_LEN {
            return Err(GatewayError::InvalidConfigLen.into());
        }
        let mut h = GatewayHeader::zeroed();
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(&data[..CONFIG_LEN]);
        Ok(h)
    }

    pub fn write_header(data: &mut [u8], h: &GatewayHeader) -> Result<(), ProgramError> {
        if data.len() < CONFIG_LEN {
            return Err(GatewayError::InvalidConfigLen.into());
        }
        data[..CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(h));
        Ok(())
    }

    pub fn load_config(data: &[u8]) -> Result<GatewayConfig, ProgramError> {
        if data.len() != CONFIG_LEN {
            return Err(GatewayError::InvalidConfigLen.into());
        }
        let h = read_header(data)?;
        if h.magic != MAGIC { return Err(GatewayError::NotInitialized.into()); }
        if h.version != VERSION { return Err(GatewayError::InvalidVersion.into()); }
        Ok(GatewayConfig {
            owner: Pubkey::new_from_array(h.owner),
            counterparty: Pubkey::new_from_array(h.counterparty),
            market_authority: Pubkey::new_from_array(h.market_authority),
            authority_bump: h.authority_bump,
        })
    }
}

// 6. mod market
/// Accounts owned by the market authority program. The gateway only reads
/// them; writers here exist for fixtures and for the in-process stand-in of
/// the market authority used under test.
pub mod market {
    use bytemuck::{Pod, Zeroable};
    use core::mem::size_of;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::{
        accounts,
        constants::{
            EMERGENCY_MAGIC, EMERGENCY_SEED, POSITION_MAGIC, POSITION_SEED, SYMBOL_MAGIC, SYMBOL_SEED,
        },
        error::GatewayError,
        examiner::{Ledger, Position, Symbol, SymbolRegistry},
    };

    pub const POSITION_STATUS_OPENED: u8 = 1;
    pub const POSITION_STATUS_CLOSED: u8 = 2;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct PositionRecord {
        pub magic: u64,
        pub id: u64,
        pub symbol_id: u64,
        pub party_a: [u8; 32],
        pub party_b: [u8; 32],
        pub status: u8,
        pub _padding: [u8; 7],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SymbolRecord {
        pub magic: u64,
        pub symbol_id: u64,
        pub is_valid: u8,
        pub _padding: [u8; 7],
        pub name: [u8; 32],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct EmergencyStatusRecord {
        pub magic: u64,
        pub party_b: [u8; 32],
        pub emergency: u8,
        pub _padding: [u8; 7],
    }

    pub fn position_address(market_authority: &Pubkey, id: u64) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[POSITION_SEED, &id.to_le_bytes()], market_authority)
    }

    pub fn symbol_address(market_authority: &Pubkey, symbol_id: u64) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[SYMBOL_SEED, &symbol_id.to_le_bytes()], market_authority)
    }

    pub fn emergency_status_address(market_authority: &Pubkey, party_b: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[EMERGENCY_SEED, party_b.as_ref()], market_authority)
    }

    pub fn read_record<T: Pod>(data: &[u8]) -> Result<T, ProgramError> {
        let len = size_of::<T>();
        if data.len() < len {
            return Err(ProgramError::InvalidAccountData);
        }
        let mut record = T::zeroed();
        bytemuck::bytes_of_mut(&mut record).copy_from_slice(&data[..len]);
        Ok(record)
    }

    pub fn write_record<T: Pod>(data: &mut [u8], record: &T) -> Result<(), ProgramError> {
        let len = size_of::<T>();
        if data.len() < len {
            return Err(ProgramError::InvalidAccountData);
        }
        data[..len].copy_from_slice(bytemuck::bytes_of(record));
        Ok(())
    }

    pub fn read_emergency_status(ai: &AccountInfo, party_b: &Pubkey) -> Result<bool, ProgramError> {
        let data = ai.try_borrow_data()?;
        let record: EmergencyStatusRecord = read_record(&data)?;
        if record.magic != EMERGENCY_MAGIC || record.party_b != party_b.to_bytes() {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(record.emergency != 0)
    }

    fn find_account<'a, 'b>(accounts: &'b [AccountInfo<'a>], key: &Pubkey) -> Option<&'b AccountInfo<'a>> {
        accounts.iter().find(|ai| ai.key == key)
    }

    /// Position lookups against the accounts supplied with the instruction.
    pub struct AccountLedger<'a, 'b> {
        market_authority: Pubkey,
        accounts: &'b [AccountInfo<'a>],
    }

    impl<'a, 'b> AccountLedger<'a, 'b> {
        pub fn new(market_authority: Pubkey, accounts: &'b [AccountInfo<'a>]) -> Self {
            Self { market_authority, accounts }
        }
    }

    impl<'a, 'b> Ledger for AccountLedger<'a, 'b> {
        fn get_position(&self, id: u64) -> Result<Position, ProgramError> {
            let (address, _) = position_address(&self.market_authority, id);
            let ai = find_account(self.accounts, &address).ok_or(GatewayError::PositionNotFound)?;
            accounts::expect_owner(ai, &self.market_authority)?;

            let data = ai.try_borrow_data()?;
            let record: PositionRecord = read_record(&data)?;
            if record.magic != POSITION_MAGIC || record.id != id {
                return Err(GatewayError::PositionNotFound.into());
            }
            Ok(Position {
                id: record.id,
                symbol_id: record.symbol_id,
                party_a: Pubkey::new_from_array(record.party_a),
                party_b: Pubkey::new_from_array(record.party_b),
                status: record.status,
            })
        }
    }

    /// Symbol lookups against the accounts supplied with the instruction.
    pub struct AccountRegistry<'a, 'b> {
        market_authority: Pubkey,
        accounts: &'b [AccountInfo<'a>],
    }

    impl<'a, 'b> AccountRegistry<'a, 'b> {
        pub fn new(market_authority: Pubkey, accounts: &'b [AccountInfo<'a>]) -> Self {
            Self { market_authority, accounts }
        }
    }

    impl<'a, 'b> SymbolRegistry for AccountRegistry<'a, 'b> {
        fn get_symbol(&self, symbol_id: u64) -> Result<Symbol, ProgramError> {
            let (address, _) = symbol_address(&self.market_authority, symbol_id);
            let ai = find_account(self.accounts, &address).ok_or(GatewayError::SymbolNotFound)?;
            accounts::expect_owner(ai, &self.market_authority)?;

            let data = ai.try_borrow_data()?;
            let record: SymbolRecord = read_record(&data)?;
            if record.magic != SYMBOL_MAGIC || record.symbol_id != symbol_id {
                return Err(GatewayError::SymbolNotFound.into());
            }
            Ok(Symbol { id: record.symbol_id, is_valid: record.is_valid != 0 })
        }
    }
}

// 7. mod calldata
pub mod calldata {
    use arrayref::array_ref;
    use solana_program::program_error::ProgramError;
    use crate::{
        constants::{EMERGENCY_CLOSE_ENTRY_LEN, POSITION_ID_LEN, SELECTOR_EMERGENCY_CLOSE, SELECTOR_LEN},
        error::GatewayError,
    };

    /// Checks that `entry` calls the one forwardable operation and returns
    /// its argument payload.
    pub fn validate_entry(entry: &[u8]) -> Result<&[u8], ProgramError> {
        if entry.len() < SELECTOR_LEN {
            return Err(GatewayError::InvalidCallData.into());
        }
        if *array_ref![entry, 0, SELECTOR_LEN] != SELECTOR_EMERGENCY_CLOSE {
            return Err(GatewayError::SelectorNotAllowed.into());
        }
        Ok(&entry[SELECTOR_LEN..])
    }

    pub fn decode_position_id(args: &[u8]) -> Result<u64, ProgramError> {
        if args.len() != POSITION_ID_LEN {
            return Err(GatewayError::InvalidCallData.into());
        }
        Ok(u64::from_le_bytes(*array_ref![args, 0, POSITION_ID_LEN]))
    }

    pub fn encode_emergency_close(position_id: u64) -> Vec<u8> {
        let mut entry = Vec::with_capacity(EMERGENCY_CLOSE_ENTRY_LEN);
        entry.extend_from_slice(&SELECTOR_EMERGENCY_CLOSE);
        entry.extend_from_slice(&position_id.to_le_bytes());
        entry
    }
}

// 8. mod examiner
pub mod examiner {
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::{calldata, error::GatewayError};

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Position {
        pub id: u64,
        pub symbol_id: u64,
        pub party_a: Pubkey,
        pub party_b: Pubkey,
        pub status: u8,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Symbol {
        pub id: u64,
        pub is_valid: bool,
    }

    pub trait Ledger {
        fn get_position(&self, id: u64) -> Result<Position, ProgramError>;
    }

    pub trait SymbolRegistry {
        fn get_symbol(&self, symbol_id: u64) -> Result<Symbol, ProgramError>;
    }

    /// Resolves the position an entry targets. Only positions on an
    /// invalidated symbol pass.
    pub fn examine<L, R>(args: &[u8], ledger: &L, registry: &R) -> Result<Position, ProgramError>
    where
        L: Ledger + ?Sized,
        R: SymbolRegistry + ?Sized,
    {
        let position_id = calldata::decode_position_id(args)?;
        let position = ledger.get_position(position_id)?;
        let symbol = registry.get_symbol(position.symbol_id)?;
        if symbol.is_valid {
            return Err(GatewayError::SymbolStillValid.into());
        }
        Ok(position)
    }
}

// 9. mod guard
pub mod guard {
    use solana_program::program_error::ProgramError;
    use crate::error::GatewayError;

    /// The party whose positions get closed, as seen by the gateway.
    pub trait Counterparty {
        fn emergency_status(&self) -> Result<bool, ProgramError>;
        fn set_emergency_status(&mut self, status: bool) -> Result<(), ProgramError>;
        /// Forwards one validated entry, unchanged, to the privileged endpoint.
        fn dispatch(&mut self, entry: &[u8]) -> Result<(), ProgramError>;
    }

    pub fn require_not_in_emergency<C: Counterparty + ?Sized>(counterparty: &C) -> Result<(), ProgramError> {
        if counterparty.emergency_status()? {
            return Err(GatewayError::AlreadyInEmergency.into());
        }
        Ok(())
    }

    /// Runs `body` with the emergency flag raised and lowers it again on
    /// every exit path. An error from `body` takes precedence over an error
    /// from the release.
    pub fn with_emergency_window<C, T, F>(counterparty: &mut C, body: F) -> Result<T, ProgramError>
    where
        C: Counterparty + ?Sized,
        F: FnOnce(&mut C) -> Result<T, ProgramError>,
    {
        require_not_in_emergency(counterparty)?;
        counterparty.set_emergency_status(true)?;

        let outcome = body(&mut *counterparty);
        let released = counterparty.set_emergency_status(false);

        let value = outcome?;
        released?;
        Ok(value)
    }
}

// 10. mod access
pub mod access {
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::error::GatewayError;

    pub fn require_owner(owner: &Pubkey, caller: &Pubkey) -> Result<(), ProgramError> {
        if owner != caller {
            return Err(GatewayError::NotOwner.into());
        }
        Ok(())
    }
}

// 11. mod executor
pub mod executor {
    use solana_program::{entrypoint::ProgramResult, msg, program_error::ProgramError, pubkey::Pubkey};
    use crate::{
        access, calldata,
        error::GatewayError,
        examiner::{self, Ledger, Position, SymbolRegistry},
        guard::{self, Counterparty},
    };

    /// Owner-gated batch of emergency closes. Entries are handled strictly in
    /// order and the first failure aborts the whole batch.
    pub fn emergency_close_positions<E, L, R, C>(
        owner: &Pubkey,
        caller: &Pubkey,
        entries: &[E],
        ledger: &L,
        registry: &R,
        counterparty: &mut C,
    ) -> ProgramResult
    where
        E: AsRef<[u8]>,
        L: Ledger + ?Sized,
        R: SymbolRegistry + ?Sized,
        C: Counterparty + ?Sized,
    {
        access::require_owner(owner, caller)?;

        msg!("EmergencyClosePositions: {} entries", entries.len());
        if entries.is_empty() {
            return guard::require_not_in_emergency(counterparty);
        }

        guard::with_emergency_window(counterparty, |counterparty| {
            for entry in entries {
                let entry = entry.as_ref();
                let args = calldata::validate_entry(entry)?;
                let position = examiner::examine(args, ledger, registry)?;
                dispatch_entry(counterparty, entry, &position)?;
            }
            Ok(())
        })
    }

    fn dispatch_entry<C: Counterparty + ?Sized>(counterparty: &mut C, entry: &[u8], position: &Position) -> ProgramResult {
        if let Err(e) = counterparty.dispatch(entry) {
            msg!("EmergencyClosePosition rejected: position={} err={:?}", position.id, e);
            return Err(ProgramError::from(GatewayError::DispatchFailed));
        }
        msg!("EmergencyClosePosition: position={} symbol={}", position.id, position.symbol_id);
        Ok(())
    }
}

// 12. mod cpi
pub mod cpi {
    use solana_program::{account_info::AccountInfo, msg, program_error::ProgramError, pubkey::Pubkey};
    use crate::{constants::GATEWAY_SEED, guard::Counterparty, market};

    #[cfg(not(test))]
    use solana_program::{
        instruction::{AccountMeta, Instruction as SolInstruction},
        program::invoke_signed,
    };
    #[cfg(not(test))]
    use crate::constants::SET_EMERGENCY_STATUS_TAG;

    #[cfg(test)]
    use crate::{calldata, constants::SELECTOR_LEN, market::{EmergencyStatusRecord, PositionRecord}};
    #[cfg(test)]
    use memoffset::offset_of;

    /// The counterparty program, reached through signed CPIs made by the
    /// gateway authority PDA.
    pub struct CpiCounterparty<'a, 'b> {
        pub market_authority: &'b AccountInfo<'a>,
        pub counterparty: &'b AccountInfo<'a>,
        pub gateway_authority: &'b AccountInfo<'a>,
        pub status_record: &'b AccountInfo<'a>,
        pub forwarded: &'b [AccountInfo<'a>],
        pub config_key: Pubkey,
        pub authority_bump: u8,
    }

    impl<'a, 'b> Counterparty for CpiCounterparty<'a, 'b> {
        fn emergency_status(&self) -> Result<bool, ProgramError> {
            market::read_emergency_status(self.status_record, self.counterparty.key)
        }

        fn set_emergency_status(&mut self, status: bool) -> Result<(), ProgramError> {
            let bump = [self.authority_bump];
            let seeds: [&[u8]; 3] = [GATEWAY_SEED, self.config_key.as_ref(), &bump];
            set_emergency_status(
                self.market_authority,
                self.gateway_authority,
                self.status_record,
                self.counterparty.key,
                status,
                &seeds,
            )?;
            msg!("PartyBEmergencyStatusSet: {} {}", self.counterparty.key, status);
            Ok(())
        }

        fn dispatch(&mut self, entry: &[u8]) -> Result<(), ProgramError> {
            let bump = [self.authority_bump];
            let seeds: [&[u8]; 3] = [GATEWAY_SEED, self.config_key.as_ref(), &bump];
            dispatch(
                self.counterparty,
                self.gateway_authority,
                self.status_record,
                self.forwarded,
                entry,
                &seeds,
            )
        }
    }

    pub fn set_emergency_status<'a>(
        _market_authority: &AccountInfo<'a>,
        _gateway_authority: &AccountInfo<'a>,
        status_record: &AccountInfo<'a>,
        party_b: &Pubkey,
        status: bool,
        _signer_seeds: &[&[u8]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let mut data = Vec::with_capacity(34);
            data.push(SET_EMERGENCY_STATUS_TAG);
            data.extend_from_slice(party_b.as_ref());
            data.push(status as u8);

            let ix = SolInstruction {
                program_id: *_market_authority.key,
                accounts: vec![
                    AccountMeta::new_readonly(*_gateway_authority.key, true),
                    AccountMeta::new(*status_record.key, false),
                ],
                data,
            };
            invoke_signed(
                &ix,
                &[_gateway_authority.clone(), status_record.clone(), _market_authority.clone()],
                &[_signer_seeds],
            )
        }
        #[cfg(test)]
        {
            market::read_emergency_status(status_record, party_b)?;
            let mut data = status_record.try_borrow_mut_data()?;
            data[offset_of!(EmergencyStatusRecord, emergency)] = status as u8;
            Ok(())
        }
    }

    pub fn dispatch<'a>(
        counterparty: &AccountInfo<'a>,
        _gateway_authority: &AccountInfo<'a>,
        status_record: &AccountInfo<'a>,
        forwarded: &[AccountInfo<'a>],
        entry: &[u8],
        _signer_seeds: &[&[u8]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let mut metas = Vec::with_capacity(2 + forwarded.len());
            metas.push(AccountMeta::new_readonly(*_gateway_authority.key, true));
            metas.push(AccountMeta::new_readonly(*status_record.key, false));
            for acc in forwarded {
                metas.push(if acc.is_writable { AccountMeta::new(*acc.key, acc.is_signer) } else { AccountMeta::new_readonly(*acc.key, acc.is_signer) });
            }

            let ix = SolInstruction {
                program_id: *counterparty.key,
                accounts: metas,
                data: entry.to_vec(),
            };

            let mut infos: Vec<AccountInfo> = Vec::with_capacity(3 + forwarded.len());
            infos.push(_gateway_authority.clone());
            infos.push(status_record.clone());
            infos.extend(forwarded.iter().cloned());
            infos.push(counterparty.clone());

            invoke_signed(&ix, &infos, &[_signer_seeds])
        }
        #[cfg(test)]
        {
            // counterparty honours the close only inside the emergency window
            if !market::read_emergency_status(status_record, counterparty.key)? {
                return Err(ProgramError::InvalidAccountData);
            }
            let position_id = calldata::decode_position_id(&entry[SELECTOR_LEN..])?;
            let (address, _) = market::position_address(status_record.owner, position_id);
            let ai = forwarded.iter().find(|ai| *ai.key == address).ok_or(ProgramError::NotEnoughAccountKeys)?;

            let mut data = ai.try_borrow_mut_data()?;
            let record: PositionRecord = market::read_record(&data)?;
            if record.status == market::POSITION_STATUS_CLOSED {
                return Err(ProgramError::InvalidAccountData);
            }
            data[offset_of!(PositionRecord, status)] = market::POSITION_STATUS_CLOSED;
            Ok(())
        }
    }
}

// 13. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg, pubkey::Pubkey,
    };
    use crate::{
        access,
        accounts,
        constants::{CONFIG_LEN, MAGIC, VERSION},
        cpi::CpiCounterparty,
        error::GatewayError,
        executor,
        ix::Instruction,
        market::{self, AccountLedger, AccountRegistry},
        state::{self, GatewayHeader},
    };

    pub fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitGateway { owner, counterparty, market_authority } => {
                accounts::expect_len(accounts, 2)?;
                let a_payer = &accounts[0];
                let a_config = &accounts[1];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_config)?;
                accounts::expect_owner(a_config, program_id)?;

                let mut data = a_config.try_borrow_mut_data()?;
                if data.len() != CONFIG_LEN { return Err(GatewayError::InvalidConfigLen.into()); }

                let header = state::read_header(&data)?;
                if header.magic == MAGIC { return Err(GatewayError::AlreadyInitialized.into()); }

                let (_, bump) = accounts::derive_gateway_authority(program_id, a_config.key);

                let new_header = GatewayHeader {
                    magic: MAGIC,
                    version: VERSION,
                    authority_bump: bump,
                    _padding: [0; 3],
                    owner: owner.to_bytes(),
                    counterparty: counterparty.to_bytes(),
                    market_authority: market_authority.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header)?;
                msg!("GatewayInitialized: owner={} counterparty={} market={}", owner, counterparty, market_authority);
            },
            Instruction::EmergencyClosePositions { entries } => {
                accounts::expect_len(accounts, 6)?;
                let a_caller = &accounts[0];
                let a_config = &accounts[1];
                let a_authority = &accounts[2];
                let a_market = &accounts[3];
                let a_counterparty = &accounts[4];
                let a_status = &accounts[5];
                let records = &accounts[6..];

                accounts::expect_signer(a_caller)?;
                accounts::expect_owner(a_config, program_id)?;

                let config = state::load_config(&a_config.try_borrow_data()?)?;
                access::require_owner(&config.owner, a_caller.key)?;

                let authority = accounts::gateway_authority_address(program_id, a_config.key, config.authority_bump)?;
                accounts::expect_key(a_authority, &authority)?;
                accounts::expect_key(a_market, &config.market_authority)?;
                accounts::expect_key(a_counterparty, &config.counterparty)?;

                accounts::expect_writable(a_status)?;
                accounts::expect_owner(a_status, &config.market_authority)?;
                let (status_address, _) = market::emergency_status_address(&config.market_authority, &config.counterparty);
                accounts::expect_key(a_status, &status_address)?;

                let ledger = AccountLedger::new(config.market_authority, records);
                let registry = AccountRegistry::new(config.market_authority, records);
                let mut counterparty = CpiCounterparty {
                    market_authority: a_market,
                    counterparty: a_counterparty,
                    gateway_authority: a_authority,
                    status_record: a_status,
                    forwarded: records,
                    config_key: *a_config.key,
                    authority_bump: config.authority_bump,
                };

                executor::emergency_close_positions(
                    &config.owner,
                    a_caller.key,
                    entries.as_slice(),
                    &ledger,
                    &registry,
                    &mut counterparty,
                )?;
            }
        }
        Ok(())
    }
}

// 14. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult,
        program_error::PrintProgramError, pubkey::Pubkey,
    };
    use crate::{error::GatewayError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            error.print::<GatewayError>();
            return Err(error);
        }
        Ok(())
    }
}

/// Address of the gateway authority PDA for a config account.
pub fn gateway_authority(program_id: &Pubkey, config_key: &Pubkey) -> Pubkey {
    accounts::derive_gateway_authority(program_id, config_key).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_program::{account_info::AccountInfo, entrypoint::ProgramResult, program_error::ProgramError};
    use crate::{
        calldata,
        constants::{CONFIG_LEN, EMERGENCY_MAGIC, POSITION_MAGIC, SYMBOL_MAGIC},
        error::GatewayError,
        ix::{self, Instruction},
        market::{self, EmergencyStatusRecord, PositionRecord, SymbolRecord},
        processor::process_instruction,
        state,
    };

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
        executable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false, executable: false }
        }
        fn signer(mut self) -> Self { self.is_signer = true; self }
        fn writable(mut self) -> Self { self.is_writable = true; self }
        fn executable(mut self) -> Self { self.executable = true; self }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                self.executable,
                0,
            )
        }
    }

    // --- Builders ---

    fn record_bytes<T: bytemuck::Pod>(record: &T) -> Vec<u8> {
        bytemuck::bytes_of(record).to_vec()
    }

    fn make_position(market: &Pubkey, id: u64, symbol_id: u64, party_b: &Pubkey) -> TestAccount {
        let (key, _) = market::position_address(market, id);
        let record = PositionRecord {
            magic: POSITION_MAGIC,
            id,
            symbol_id,
            party_a: Pubkey::new_unique().to_bytes(),
            party_b: party_b.to_bytes(),
            status: market::POSITION_STATUS_OPENED,
            _padding: [0; 7],
        };
        TestAccount::new(key, *market, 0, record_bytes(&record)).writable()
    }

    fn make_symbol(market: &Pubkey, symbol_id: u64, is_valid: bool) -> TestAccount {
        let (key, _) = market::symbol_address(market, symbol_id);
        let mut name = [0u8; 32];
        name[..7].copy_from_slice(b"BTCUSDT");
        let record = SymbolRecord {
            magic: SYMBOL_MAGIC,
            symbol_id,
            is_valid: is_valid as u8,
            _padding: [0; 7],
            name,
        };
        TestAccount::new(key, *market, 0, record_bytes(&record))
    }

    fn make_status(market: &Pubkey, party_b: &Pubkey, emergency: bool) -> TestAccount {
        let (key, _) = market::emergency_status_address(market, party_b);
        let record = EmergencyStatusRecord {
            magic: EMERGENCY_MAGIC,
            party_b: party_b.to_bytes(),
            emergency: emergency as u8,
            _padding: [0; 7],
        };
        TestAccount::new(key, *market, 0, record_bytes(&record)).writable()
    }

    fn emergency_flag(status: &TestAccount) -> bool {
        market::read_record::<EmergencyStatusRecord>(&status.data).unwrap().emergency != 0
    }

    fn position_status(position: &TestAccount) -> u8 {
        market::read_record::<PositionRecord>(&position.data).unwrap().status
    }

    struct GatewayFixture {
        program_id: Pubkey,
        owner: TestAccount,
        config: TestAccount,
        authority: TestAccount,
        market: TestAccount,
        counterparty: TestAccount,
        status: TestAccount,
    }

    fn setup_gateway() -> GatewayFixture {
        let program_id = Pubkey::new_unique();
        let market_id = Pubkey::new_unique();
        let counterparty_id = Pubkey::new_unique();
        let config_key = Pubkey::new_unique();

        let mut f = GatewayFixture {
            program_id,
            owner: TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer(),
            config: TestAccount::new(config_key, program_id, 0, vec![0u8; CONFIG_LEN]).writable(),
            authority: TestAccount::new(gateway_authority(&program_id, &config_key), solana_program::system_program::id(), 0, vec![]),
            market: TestAccount::new(market_id, Pubkey::default(), 0, vec![]).executable(),
            counterparty: TestAccount::new(counterparty_id, Pubkey::default(), 0, vec![]).executable(),
            status: make_status(&market_id, &counterparty_id, false),
        };

        let data = ix::init_gateway(&program_id, &f.owner.key, &config_key, f.owner.key, counterparty_id, market_id).data;
        {
            let accs = vec![f.owner.to_info(), f.config.to_info()];
            process_instruction(&f.program_id, &accs, &data).unwrap();
        }
        f
    }

    fn close_as(
        f: &mut GatewayFixture,
        caller: Option<&mut TestAccount>,
        records: &mut [TestAccount],
        entries: Vec<Vec<u8>>,
    ) -> ProgramResult {
        let data = ix::emergency_close_positions(
            &f.program_id,
            &f.owner.key,
            &f.config.key,
            &f.counterparty.key,
            &f.market.key,
            &[],
            entries,
        )
        .data;

        let first = match caller {
            Some(c) => c.to_info(),
            None => f.owner.to_info(),
        };
        let mut accs = vec![
            first,
            f.config.to_info(),
            f.authority.to_info(),
            f.market.to_info(),
            f.counterparty.to_info(),
            f.status.to_info(),
        ];
        accs.extend(records.iter_mut().map(|r| r.to_info()));
        process_instruction(&f.program_id, &accs, &data)
    }

    fn close(f: &mut GatewayFixture, records: &mut [TestAccount], entries: Vec<Vec<u8>>) -> ProgramResult {
        close_as(f, None, records, entries)
    }

    // --- Tests ---

    #[test]
    fn test_init_gateway_stores_wiring() {
        let f = setup_gateway();
        let config = state::load_config(&f.config.data).unwrap();
        assert_eq!(config.owner, f.owner.key);
        assert_eq!(config.counterparty, f.counterparty.key);
        assert_eq!(config.market_authority, f.market.key);
        assert_eq!(gateway_authority(&f.program_id, &f.config.key), f.authority.key);
    }

    #[test]
    fn test_init_gateway_twice() {
        let mut f = setup_gateway();
        let data = Instruction::InitGateway {
            owner: Pubkey::new_unique(),
            counterparty: f.counterparty.key,
            market_authority: f.market.key,
        }
        .encode();
        let accs = vec![f.owner.to_info(), f.config.to_info()];
        let res = process_instruction(&f.program_id, &accs, &data);
        assert_eq!(res, Err(GatewayError::AlreadyInitialized.into()));
    }

    #[test]
    fn test_init_gateway_wrong_len() {
        let program_id = Pubkey::new_unique();
        let mut payer = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        let mut config = TestAccount::new(Pubkey::new_unique(), program_id, 0, vec![0u8; CONFIG_LEN - 1]).writable();
        let data = Instruction::InitGateway {
            owner: payer.key,
            counterparty: Pubkey::new_unique(),
            market_authority: Pubkey::new_unique(),
        }
        .encode();
        let accs = vec![payer.to_info(), config.to_info()];
        let res = process_instruction(&program_id, &accs, &data);
        assert_eq!(res, Err(GatewayError::InvalidConfigLen.into()));
    }

    #[test]
    fn test_init_gateway_foreign_config() {
        let program_id = Pubkey::new_unique();
        let mut payer = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        let mut config = TestAccount::new(Pubkey::new_unique(), Pubkey::new_unique(), 0, vec![0u8; CONFIG_LEN]).writable();
        let data = Instruction::InitGateway {
            owner: payer.key,
            counterparty: Pubkey::new_unique(),
            market_authority: Pubkey::new_unique(),
        }
        .encode();
        let accs = vec![payer.to_info(), config.to_info()];
        let res = process_instruction(&program_id, &accs, &data);
        assert_eq!(res, Err(ProgramError::IllegalOwner));
    }

    #[test]
    fn test_close_before_init() {
        let program_id = Pubkey::new_unique();
        let market_id = Pubkey::new_unique();
        let counterparty_id = Pubkey::new_unique();
        let mut owner = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        let mut config = TestAccount::new(Pubkey::new_unique(), program_id, 0, vec![0u8; CONFIG_LEN]);
        let mut authority = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]);
        let mut market = TestAccount::new(market_id, Pubkey::default(), 0, vec![]);
        let mut counterparty = TestAccount::new(counterparty_id, Pubkey::default(), 0, vec![]);
        let mut status = make_status(&market_id, &counterparty_id, false);

        let data = Instruction::EmergencyClosePositions { entries: vec![] }.encode();
        let accs = vec![
            owner.to_info(), config.to_info(), authority.to_info(),
            market.to_info(), counterparty.to_info(), status.to_info(),
        ];
        let res = process_instruction(&program_id, &accs, &data);
        assert_eq!(res, Err(GatewayError::NotInitialized.into()));
    }

    #[test]
    fn test_non_owner_rejected() {
        let mut f = setup_gateway();
        let mut stranger = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        let res = close_as(&mut f, Some(&mut stranger), &mut [], vec![]);
        assert_eq!(res, Err(GatewayError::NotOwner.into()));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_owner_must_sign() {
        let mut f = setup_gateway();
        f.owner.is_signer = false;
        let res = close(&mut f, &mut [], vec![]);
        assert_eq!(res, Err(GatewayError::ExpectedSigner.into()));
    }

    #[test]
    fn test_empty_batch() {
        let mut f = setup_gateway();
        close(&mut f, &mut [], vec![]).unwrap();
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_already_in_emergency() {
        let mut f = setup_gateway();
        f.status = make_status(&f.market.key, &f.counterparty.key, true);
        let res = close(&mut f, &mut [], vec![]);
        assert_eq!(res, Err(GatewayError::AlreadyInEmergency.into()));
        assert!(emergency_flag(&f.status));
    }

    #[test]
    fn test_short_entry() {
        let mut f = setup_gateway();
        let res = close(&mut f, &mut [], vec![vec![0xa3, 0x03, 0x94]]);
        assert_eq!(res, Err(GatewayError::InvalidCallData.into()));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_foreign_selector() {
        let mut f = setup_gateway();
        let res = close(&mut f, &mut [], vec![vec![0xde, 0xad, 0xbe, 0xef]]);
        assert_eq!(res, Err(GatewayError::SelectorNotAllowed.into()));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_symbol_still_valid() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_symbol(&f.market.key, 7, true),
        ];
        let res = close(&mut f, &mut records, vec![calldata::encode_emergency_close(1)]);
        assert_eq!(res, Err(GatewayError::SymbolStillValid.into()));
        assert_eq!(position_status(&records[0]), market::POSITION_STATUS_OPENED);
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_close_on_invalid_symbol() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_symbol(&f.market.key, 7, false),
        ];
        close(&mut f, &mut records, vec![calldata::encode_emergency_close(1)]).unwrap();
        assert_eq!(position_status(&records[0]), market::POSITION_STATUS_CLOSED);
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_batch_over_shared_symbol() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_position(&f.market.key, 2, 7, &f.counterparty.key),
            make_symbol(&f.market.key, 7, false),
        ];
        let entries = vec![calldata::encode_emergency_close(2), calldata::encode_emergency_close(1)];
        close(&mut f, &mut records, entries).unwrap();
        assert_eq!(position_status(&records[0]), market::POSITION_STATUS_CLOSED);
        assert_eq!(position_status(&records[1]), market::POSITION_STATUS_CLOSED);
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_healthy_symbol_mid_batch() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_position(&f.market.key, 2, 8, &f.counterparty.key),
            make_symbol(&f.market.key, 7, false),
            make_symbol(&f.market.key, 8, true),
        ];
        let entries = vec![calldata::encode_emergency_close(1), calldata::encode_emergency_close(2)];
        let res = close(&mut f, &mut records, entries);
        assert_eq!(res, Err(GatewayError::SymbolStillValid.into()));
        assert_eq!(position_status(&records[1]), market::POSITION_STATUS_OPENED);
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_counterparty_rejection() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_symbol(&f.market.key, 7, false),
        ];
        // second close of the same position is refused by the counterparty
        let entries = vec![calldata::encode_emergency_close(1), calldata::encode_emergency_close(1)];
        let res = close(&mut f, &mut records, entries);
        assert_eq!(res, Err(GatewayError::DispatchFailed.into()));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_missing_position_record() {
        let mut f = setup_gateway();
        let mut records = [make_symbol(&f.market.key, 7, false)];
        let res = close(&mut f, &mut records, vec![calldata::encode_emergency_close(1)]);
        assert_eq!(res, Err(GatewayError::PositionNotFound.into()));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_position_record_wrong_owner() {
        let mut f = setup_gateway();
        let mut forged = make_position(&f.market.key, 1, 7, &f.counterparty.key);
        forged.owner = Pubkey::new_unique();
        let mut records = [forged, make_symbol(&f.market.key, 7, false)];
        let res = close(&mut f, &mut records, vec![calldata::encode_emergency_close(1)]);
        assert_eq!(res, Err(ProgramError::IllegalOwner));
        assert!(!emergency_flag(&f.status));
    }

    #[test]
    fn test_wrong_gateway_authority() {
        let mut f = setup_gateway();
        f.authority.key = Pubkey::new_unique();
        let res = close(&mut f, &mut [], vec![]);
        assert_eq!(res, Err(ProgramError::InvalidArgument));
    }

    #[test]
    fn test_wrong_counterparty() {
        let mut f = setup_gateway();
        f.counterparty.key = Pubkey::new_unique();
        let res = close(&mut f, &mut [], vec![]);
        assert_eq!(res, Err(ProgramError::InvalidArgument));
    }

    #[test]
    fn test_status_record_must_be_writable() {
        let mut f = setup_gateway();
        f.status.is_writable = false;
        let res = close(&mut f, &mut [], vec![]);
        assert_eq!(res, Err(GatewayError::ExpectedWritable.into()));
    }

    #[test]
    fn test_two_sequential_windows() {
        let mut f = setup_gateway();
        let mut records = [
            make_position(&f.market.key, 1, 7, &f.counterparty.key),
            make_position(&f.market.key, 2, 7, &f.counterparty.key),
            make_symbol(&f.market.key, 7, false),
        ];
        close(&mut f, &mut records, vec![calldata::encode_emergency_close(1)]).unwrap();
        assert!(!emergency_flag(&f.status));
        close(&mut f, &mut records, vec![calldata::encode_emergency_close(2)]).unwrap();
        assert!(!emergency_flag(&f.status));
        assert_eq!(position_status(&records[1]), market::POSITION_STATUS_CLOSED);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(Instruction::decode(&[]), Err(ProgramError::InvalidInstructionData));
        assert_eq!(Instruction::decode(&[9]), Err(ProgramError::InvalidInstructionData));
        // one entry announced, none present
        assert_eq!(Instruction::decode(&[1, 1, 0]), Err(ProgramError::InvalidInstructionData));
        // entry length runs past the end
        assert_eq!(Instruction::decode(&[1, 1, 0, 8, 0, 0, 0, 0xa3]), Err(ProgramError::InvalidInstructionData));

        let mut data = Instruction::EmergencyClosePositions { entries: vec![calldata::encode_emergency_close(1)] }.encode();
        data.push(0);
        assert_eq!(Instruction::decode(&data), Err(ProgramError::InvalidInstructionData));
    }

    #[test]
    fn test_decode_keeps_entries_verbatim() {
        let entries = vec![vec![], vec![1, 2, 3], calldata::encode_emergency_close(u64::MAX)];
        let data = Instruction::EmergencyClosePositions { entries: entries.clone() }.encode();
        assert_eq!(Instruction::decode(&data), Ok(Instruction::EmergencyClosePositions { entries }));
    }
}
