//! Oracle program instructions
//!
//! Instruction data starts with an 8 byte command header (protocol version
//! and command id) followed by a command specific payload. Decoding checks
//! the header, the number of accounts and the payload, in that order.

use {
    super::{
        accounts::{
            pubkey,
            PROTOCOL_VERSION,
        },
        attrs::{
            AttrsError,
            AttrsMap,
        },
    },
    solana_sdk::{
        instruction::{
            AccountMeta,
            Instruction as SolanaInstruction,
        },
        pubkey::Pubkey,
    },
    winnow::{
        binary::{
            i8 as le_i8,
            le_i32,
            le_i64,
            le_u32,
            le_u64,
            u8 as le_u8,
        },
        combinator::repeat,
        ModalResult,
        Parser,
    },
};

pub const COMMAND_HEADER_LEN: usize = 8;

/// Number of slots in the test price arrays of `upd_test`.
pub const TEST_SLOTS: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InstructionError {
    #[error("instruction data of {len} bytes is too short for a command header")]
    TruncatedHeader { len: usize },
    #[error("unsupported instruction version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported instruction type ({0})")]
    UnknownCommand(i32),
    #[error("expected {expected} accounts for {command} but got {actual}")]
    AccountCount {
        command:  CommandId,
        expected: usize,
        actual:   usize,
    },
    #[error("{command} payload truncated: need {expected} bytes, got {actual}")]
    TruncatedPayload {
        command:  CommandId,
        expected: usize,
        actual:   usize,
    },
    #[error("while decoding {command} found {count} superfluous bytes")]
    TrailingBytes { command: CommandId, count: usize },
    #[error("invalid {command} attributes: {error}")]
    Attrs {
        command: CommandId,
        #[source]
        error:   AttrsError,
    },
}

/// Numeric command ids understood by the oracle program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandId {
    InitMapping,
    AddMapping,
    AddProduct,
    UpdProduct,
    AddPrice,
    AddPublisher,
    DelPublisher,
    UpdPrice,
    UpdPriceNoFailOnError,
    AggPrice,
    InitPrice,
    InitTest,
    UpdTest,
    SetMinPub,
}

impl CommandId {
    pub const ALL: [CommandId; 14] = [
        CommandId::InitMapping,
        CommandId::AddMapping,
        CommandId::AddProduct,
        CommandId::UpdProduct,
        CommandId::AddPrice,
        CommandId::AddPublisher,
        CommandId::DelPublisher,
        CommandId::UpdPrice,
        CommandId::UpdPriceNoFailOnError,
        CommandId::AggPrice,
        CommandId::InitPrice,
        CommandId::InitTest,
        CommandId::UpdTest,
        CommandId::SetMinPub,
    ];

    pub fn as_i32(self) -> i32 {
        match self {
            CommandId::InitMapping => 0,
            CommandId::AddMapping => 1,
            CommandId::AddProduct => 2,
            CommandId::UpdProduct => 3,
            CommandId::AddPrice => 4,
            CommandId::AddPublisher => 5,
            CommandId::DelPublisher => 6,
            CommandId::UpdPrice => 7,
            CommandId::UpdPriceNoFailOnError => 8,
            CommandId::AggPrice => 9,
            CommandId::InitPrice => 10,
            CommandId::InitTest => 11,
            CommandId::UpdTest => 12,
            CommandId::SetMinPub => 13,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandId::InitMapping => "init_mapping",
            CommandId::AddMapping => "add_mapping",
            CommandId::AddProduct => "add_product",
            CommandId::UpdProduct => "upd_product",
            CommandId::AddPrice => "add_price",
            CommandId::AddPublisher => "add_publisher",
            CommandId::DelPublisher => "del_publisher",
            CommandId::UpdPrice => "upd_price",
            CommandId::UpdPriceNoFailOnError => "upd_price_no_fail_on_error",
            CommandId::AggPrice => "agg_price",
            CommandId::InitPrice => "init_price",
            CommandId::InitTest => "init_test",
            CommandId::UpdTest => "upd_test",
            CommandId::SetMinPub => "set_min_pub",
        }
    }

    /// Exact number of accounts an instruction with this command carries.
    pub fn num_accounts(self) -> usize {
        match self {
            CommandId::AddMapping
            | CommandId::AddProduct
            | CommandId::AddPrice
            | CommandId::UpdPrice
            | CommandId::UpdPriceNoFailOnError
            | CommandId::AggPrice => 3,
            CommandId::InitMapping
            | CommandId::UpdProduct
            | CommandId::AddPublisher
            | CommandId::DelPublisher
            | CommandId::InitPrice
            | CommandId::InitTest
            | CommandId::UpdTest
            | CommandId::SetMinPub => 2,
        }
    }
}

impl TryFrom<i32> for CommandId {
    type Error = InstructionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| CommandId::ALL.get(index).copied())
            .ok_or(InstructionError::UnknownCommand(value))
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The 8 byte prefix of every instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub version: u32,
    pub command: CommandId,
}

impl CommandHeader {
    pub fn new(command: CommandId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }
}

/// Payload of `add_price` and `init_price`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriceSetup {
    pub exponent:   i32,
    pub price_type: u32,
}

impl PriceSetup {
    const LEN: usize = 8;
}

/// Payload of `add_publisher` and `del_publisher`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Publisher {
    pub publisher: Pubkey,
}

impl Publisher {
    const LEN: usize = 32;
}

/// Payload of `upd_price` and `upd_price_no_fail_on_error`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdPrice {
    pub status:   u32,
    pub unused:   u32,
    pub price:    i64,
    pub conf:     u64,
    pub pub_slot: u64,
}

impl UpdPrice {
    const LEN: usize = 32;
}

/// Payload of `upd_test`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdTest {
    pub exponent:  i32,
    pub slot_diff: [i8; TEST_SLOTS],
    pub price:     [i64; TEST_SLOTS],
    pub conf:      [u64; TEST_SLOTS],
}

impl Default for UpdTest {
    fn default() -> Self {
        Self {
            exponent:  0,
            slot_diff: [0; TEST_SLOTS],
            price:     [0; TEST_SLOTS],
            conf:      [0; TEST_SLOTS],
        }
    }
}

impl UpdTest {
    const LEN: usize = 4 + TEST_SLOTS * (1 + 8 + 8);
}

/// Payload of `set_min_pub`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetMinPub {
    pub min_pub: u8,
}

impl SetMinPub {
    const LEN: usize = 1;
}

/// A command together with its typed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    InitMapping,
    AddMapping,
    AddProduct,
    UpdProduct(AttrsMap),
    AddPrice(PriceSetup),
    AddPublisher(Publisher),
    DelPublisher(Publisher),
    UpdPrice(UpdPrice),
    UpdPriceNoFailOnError(UpdPrice),
    AggPrice,
    InitPrice(PriceSetup),
    InitTest,
    UpdTest(Box<UpdTest>),
    SetMinPub(SetMinPub),
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::InitMapping => CommandId::InitMapping,
            Command::AddMapping => CommandId::AddMapping,
            Command::AddProduct => CommandId::AddProduct,
            Command::UpdProduct(_) => CommandId::UpdProduct,
            Command::AddPrice(_) => CommandId::AddPrice,
            Command::AddPublisher(_) => CommandId::AddPublisher,
            Command::DelPublisher(_) => CommandId::DelPublisher,
            Command::UpdPrice(_) => CommandId::UpdPrice,
            Command::UpdPriceNoFailOnError(_) => CommandId::UpdPriceNoFailOnError,
            Command::AggPrice => CommandId::AggPrice,
            Command::InitPrice(_) => CommandId::InitPrice,
            Command::InitTest => CommandId::InitTest,
            Command::UpdTest(_) => CommandId::UpdTest,
            Command::SetMinPub(_) => CommandId::SetMinPub,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) -> Result<(), InstructionError> {
        match self {
            Command::InitMapping
            | Command::AddMapping
            | Command::AddProduct
            | Command::AggPrice
            | Command::InitTest => {}
            Command::UpdProduct(attrs) => {
                attrs
                    .encode_into(out)
                    .map_err(|error| InstructionError::Attrs {
                        command: CommandId::UpdProduct,
                        error,
                    })?;
            }
            Command::AddPrice(setup) | Command::InitPrice(setup) => {
                out.extend_from_slice(&setup.exponent.to_le_bytes());
                out.extend_from_slice(&setup.price_type.to_le_bytes());
            }
            Command::AddPublisher(publisher) | Command::DelPublisher(publisher) => {
                out.extend_from_slice(publisher.publisher.as_ref());
            }
            Command::UpdPrice(update) | Command::UpdPriceNoFailOnError(update) => {
                out.extend_from_slice(&update.status.to_le_bytes());
                out.extend_from_slice(&update.unused.to_le_bytes());
                out.extend_from_slice(&update.price.to_le_bytes());
                out.extend_from_slice(&update.conf.to_le_bytes());
                out.extend_from_slice(&update.pub_slot.to_le_bytes());
            }
            Command::UpdTest(test) => {
                out.extend_from_slice(&test.exponent.to_le_bytes());
                out.extend(test.slot_diff.iter().flat_map(|diff| diff.to_le_bytes()));
                out.extend(test.price.iter().flat_map(|price| price.to_le_bytes()));
                out.extend(test.conf.iter().flat_map(|conf| conf.to_le_bytes()));
            }
            Command::SetMinPub(min_pub) => out.push(min_pub.min_pub),
        }
        Ok(())
    }

    fn decode_payload(command: CommandId, data: &[u8]) -> Result<Self, InstructionError> {
        let fixed = |len: usize, parser: fn(&mut &[u8]) -> ModalResult<Command>| {
            if data.len() < len {
                return Err(InstructionError::TruncatedPayload {
                    command,
                    expected: len,
                    actual: data.len(),
                });
            }
            if data.len() > len {
                return Err(InstructionError::TrailingBytes {
                    command,
                    count: data.len() - len,
                });
            }
            let mut input = data;
            parser(&mut input).map_err(|_| InstructionError::TruncatedPayload {
                command,
                expected: len,
                actual: data.len(),
            })
        };

        match command {
            CommandId::InitMapping => fixed(0, |_| Ok(Command::InitMapping)),
            CommandId::AddMapping => fixed(0, |_| Ok(Command::AddMapping)),
            CommandId::AddProduct => fixed(0, |_| Ok(Command::AddProduct)),
            CommandId::AggPrice => fixed(0, |_| Ok(Command::AggPrice)),
            CommandId::InitTest => fixed(0, |_| Ok(Command::InitTest)),
            CommandId::UpdProduct => AttrsMap::decode(data)
                .map(Command::UpdProduct)
                .map_err(|error| InstructionError::Attrs { command, error }),
            CommandId::AddPrice => fixed(PriceSetup::LEN, |input| {
                price_setup.map(Command::AddPrice).parse_next(input)
            }),
            CommandId::InitPrice => fixed(PriceSetup::LEN, |input| {
                price_setup.map(Command::InitPrice).parse_next(input)
            }),
            CommandId::AddPublisher => fixed(Publisher::LEN, |input| {
                publisher.map(Command::AddPublisher).parse_next(input)
            }),
            CommandId::DelPublisher => fixed(Publisher::LEN, |input| {
                publisher.map(Command::DelPublisher).parse_next(input)
            }),
            CommandId::UpdPrice => fixed(UpdPrice::LEN, |input| {
                upd_price.map(Command::UpdPrice).parse_next(input)
            }),
            CommandId::UpdPriceNoFailOnError => fixed(UpdPrice::LEN, |input| {
                upd_price
                    .map(Command::UpdPriceNoFailOnError)
                    .parse_next(input)
            }),
            CommandId::UpdTest => fixed(UpdTest::LEN, |input| {
                upd_test
                    .map(|test| Command::UpdTest(Box::new(test)))
                    .parse_next(input)
            }),
            CommandId::SetMinPub => fixed(SetMinPub::LEN, |input| {
                le_u8
                    .map(|min_pub| Command::SetMinPub(SetMinPub { min_pub }))
                    .parse_next(input)
            }),
        }
    }
}

/// A decoded or constructed oracle program instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts:   Vec<AccountMeta>,
    pub command:    Command,
}

impl Instruction {
    pub fn new(program_id: Pubkey, accounts: Vec<AccountMeta>, command: Command) -> Self {
        Self {
            program_id,
            accounts,
            command,
        }
    }

    pub fn header(&self) -> CommandHeader {
        CommandHeader::new(self.command.id())
    }

    /// Decodes instruction data addressed to `program_id`.
    pub fn decode(
        program_id: Pubkey,
        accounts: Vec<AccountMeta>,
        data: &[u8],
    ) -> Result<Self, InstructionError> {
        let mut input = data;
        let (version, raw_command) = command_header(&mut input)
            .map_err(|_| InstructionError::TruncatedHeader { len: data.len() })?;
        if version != PROTOCOL_VERSION {
            return Err(InstructionError::UnsupportedVersion(version));
        }
        let command = CommandId::try_from(raw_command)?;
        if accounts.len() != command.num_accounts() {
            return Err(InstructionError::AccountCount {
                command,
                expected: command.num_accounts(),
                actual: accounts.len(),
            });
        }
        let command = Command::decode_payload(command, input)?;
        Ok(Self {
            program_id,
            accounts,
            command,
        })
    }

    /// Serialized instruction data: command header followed by the payload.
    pub fn data(&self) -> Result<Vec<u8>, InstructionError> {
        let header = self.header();
        let mut out = Vec::with_capacity(COMMAND_HEADER_LEN);
        out.extend_from_slice(&header.version.to_le_bytes());
        out.extend_from_slice(&header.command.as_i32().to_le_bytes());
        self.command.encode_payload(&mut out)?;
        Ok(out)
    }
}

impl TryFrom<&SolanaInstruction> for Instruction {
    type Error = InstructionError;

    fn try_from(instruction: &SolanaInstruction) -> Result<Self, Self::Error> {
        Instruction::decode(
            instruction.program_id,
            instruction.accounts.clone(),
            &instruction.data,
        )
    }
}

impl TryFrom<&Instruction> for SolanaInstruction {
    type Error = InstructionError;

    fn try_from(instruction: &Instruction) -> Result<Self, Self::Error> {
        Ok(SolanaInstruction {
            program_id: instruction.program_id,
            accounts:   instruction.accounts.clone(),
            data:       instruction.data()?,
        })
    }
}

fn command_header(input: &mut &[u8]) -> ModalResult<(u32, i32)> {
    (le_u32, le_i32).parse_next(input)
}

fn price_setup(input: &mut &[u8]) -> ModalResult<PriceSetup> {
    (le_i32, le_u32)
        .map(|(exponent, price_type)| PriceSetup {
            exponent,
            price_type,
        })
        .parse_next(input)
}

fn publisher(input: &mut &[u8]) -> ModalResult<Publisher> {
    pubkey
        .map(|publisher| Publisher { publisher })
        .parse_next(input)
}

fn upd_price(input: &mut &[u8]) -> ModalResult<UpdPrice> {
    (le_u32, le_u32, le_i64, le_u64, le_u64)
        .map(|(status, unused, price, conf, pub_slot)| UpdPrice {
            status,
            unused,
            price,
            conf,
            pub_slot,
        })
        .parse_next(input)
}

fn upd_test(input: &mut &[u8]) -> ModalResult<UpdTest> {
    (
        le_i32,
        repeat(TEST_SLOTS, le_i8),
        repeat(TEST_SLOTS, le_i64),
        repeat(TEST_SLOTS, le_u64),
    )
        .verify_map(
            |(exponent, slot_diff, price, conf): (i32, Vec<i8>, Vec<i64>, Vec<u64>)| {
                Some(UpdTest {
                    exponent,
                    slot_diff: slot_diff.try_into().ok()?,
                    price: price.try_into().ok()?,
                    conf: conf.try_into().ok()?,
                })
            },
        )
        .parse_next(input)
}
