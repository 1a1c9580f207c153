//! Oracle account layouts
//!
//! Every account owned by the oracle program starts with a 16 byte header
//! followed by a fixed layout that depends on the account type. All integers
//! are little-endian and records are packed, so accounts are parsed field by
//! field rather than reinterpreted in memory.

use {
    super::attrs::{
        AttrsError,
        AttrsMap,
    },
    rust_decimal::Decimal,
    solana_sdk::pubkey::Pubkey,
    winnow::{
        binary::{
            le_i32,
            le_i64,
            le_u32,
            le_u64,
        },
        token::take,
        ModalResult,
        Parser,
    },
};

/// Magic number prefixed on each account.
pub const MAGIC: u32 = 0xa1b2c3d4;

/// Version of the account and instruction format understood by this client.
pub const PROTOCOL_VERSION: u32 = 2;

/// Accounts declaring a size at or above this bound are rejected. The bound
/// is not enforced on-chain.
pub const MAX_ACCOUNT_SIZE: u32 = 65536;

/// Memcmp prefix matching the magic and version of every current account.
pub const ACCOUNT_FILTER_PREFIX: [u8; 8] = [
    0xd4, 0xc3, 0xb2, 0xa1, // magic
    0x02, 0x00, 0x00, 0x00, // version
];

pub const HEADER_LEN: usize = 16;
pub const PUBKEY_LEN: usize = 32;

/// Number of product keys stored in a single mapping account.
pub const MAPPING_CAPACITY: usize = 640;
pub const MAPPING_ACCOUNT_LEN: usize = HEADER_LEN + 8 + PUBKEY_LEN + MAPPING_CAPACITY * PUBKEY_LEN;

/// Header plus the first price key.
pub const PRODUCT_FIXED_LEN: usize = HEADER_LEN + PUBKEY_LEN;
/// Capacity of the attribute region of a product account.
pub const PRODUCT_ATTRS_CAPACITY: usize = 464;
pub const PRODUCT_ACCOUNT_LEN: usize = PRODUCT_FIXED_LEN + PRODUCT_ATTRS_CAPACITY;

/// Number of publisher components stored in a price account.
pub const MAX_COMPONENTS: usize = 32;
pub const PRICE_INFO_LEN: usize = 32;
pub const PRICE_COMPONENT_LEN: usize = PUBKEY_LEN + 2 * PRICE_INFO_LEN;
pub const PRICE_ACCOUNT_LEN: usize = 240 + MAX_COMPONENTS * PRICE_COMPONENT_LEN;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("{account_type:?} account truncated: need {expected} bytes, got {actual}")]
    Truncated {
        account_type: AccountType,
        expected:     usize,
        actual:       usize,
    },
    #[error("invalid account header (magic {magic:#x}, version {version}, size {size})")]
    InvalidHeader { magic: u32, version: u32, size: u32 },
    #[error("expected {expected:?} account, found {actual:?}")]
    WrongType {
        expected: AccountType,
        actual:   AccountType,
    },
    #[error("mapping account lists {count} products, capacity is {capacity}")]
    InvalidCount { count: u32, capacity: usize },
    #[error("product attributes take {len} bytes, capacity is {capacity}")]
    AttrsOverflow { len: usize, capacity: usize },
    #[error("invalid product attributes: {0}")]
    Attrs(#[from] AttrsError),
}

/// Identifies what an account stores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccountType {
    #[default]
    Unknown,
    Mapping,
    Product,
    Price,
}

impl AccountType {
    pub fn as_u32(self) -> u32 {
        match self {
            AccountType::Unknown => 0,
            AccountType::Mapping => 1,
            AccountType::Product => 2,
            AccountType::Price => 3,
        }
    }

    fn min_len(self) -> usize {
        match self {
            AccountType::Unknown => HEADER_LEN,
            AccountType::Mapping => MAPPING_ACCOUNT_LEN,
            AccountType::Product => PRODUCT_ACCOUNT_LEN,
            AccountType::Price => PRICE_ACCOUNT_LEN,
        }
    }
}

impl From<u32> for AccountType {
    fn from(value: u32) -> Self {
        match value {
            1 => AccountType::Mapping,
            2 => AccountType::Product,
            3 => AccountType::Price,
            _ => AccountType::Unknown,
        }
    }
}

/// Header at the beginning of each account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountHeader {
    pub magic:        u32,
    pub version:      u32,
    pub account_type: AccountType,
    /// Size of the account including the header.
    pub size:         u32,
}

impl AccountHeader {
    pub fn new(account_type: AccountType, size: u32) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            account_type,
            size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.version == PROTOCOL_VERSION && self.size < MAX_ACCOUNT_SIZE
    }

    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        let mut input = data;
        account_header(&mut input).map_err(|_| AccountError::Truncated {
            account_type: AccountType::Unknown,
            expected:     HEADER_LEN,
            actual:       data.len(),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.account_type.as_u32().to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// Determines the account type from the header alone.
///
/// Never fails: anything that does not carry a valid header is `Unknown`.
pub fn peek_account_type(data: &[u8]) -> AccountType {
    match AccountHeader::decode(data) {
        Ok(header) if header.is_valid() => header.account_type,
        _ => AccountType::Unknown,
    }
}

/// A piece of the singly linked list of all products.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingAccount {
    pub header:   AccountHeader,
    pub num:      u32,
    pub unused:   u32,
    /// Next mapping account, `Pubkey::default()` at the end of the list.
    pub next:     Pubkey,
    /// All `MAPPING_CAPACITY` slots, including the padding past `num`.
    pub products: Vec<Pubkey>,
}

impl MappingAccount {
    pub fn new(next: Pubkey, product_keys: &[Pubkey]) -> Result<Self, AccountError> {
        if product_keys.len() > MAPPING_CAPACITY {
            return Err(AccountError::InvalidCount {
                count:    u32::try_from(product_keys.len()).unwrap_or(u32::MAX),
                capacity: MAPPING_CAPACITY,
            });
        }
        let mut products = product_keys.to_vec();
        products.resize(MAPPING_CAPACITY, Pubkey::default());
        Ok(Self {
            header: AccountHeader::new(AccountType::Mapping, encoded_size(MAPPING_ACCOUNT_LEN)),
            num: u32::try_from(product_keys.len()).unwrap_or(u32::MAX),
            unused: 0,
            next,
            products,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        let mut input = data;
        let header = expect_header(&mut input, data.len(), AccountType::Mapping)?;
        let account = mapping_body(&mut input, header)
            .map_err(|_| truncated(AccountType::Mapping, data.len()))?;
        if usize::try_from(account.num).map_or(true, |num| num > MAPPING_CAPACITY) {
            return Err(AccountError::InvalidCount {
                count:    account.num,
                capacity: MAPPING_CAPACITY,
            });
        }
        Ok(account)
    }

    /// The populated product keys; slots past `num` are ignored.
    pub fn product_keys(&self) -> &[Pubkey] {
        let num = usize::try_from(self.num).unwrap_or(usize::MAX);
        self.products.get(..num).unwrap_or(&self.products)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAPPING_ACCOUNT_LEN);
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.num.to_le_bytes());
        out.extend_from_slice(&self.unused.to_le_bytes());
        out.extend_from_slice(self.next.as_ref());
        for index in 0..MAPPING_CAPACITY {
            let key = self.products.get(index).copied().unwrap_or_default();
            out.extend_from_slice(key.as_ref());
        }
        out
    }
}

/// Reference data of a single product, such as its symbol and quote currency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductAccount {
    pub header:      AccountHeader,
    /// First price account of this product, `Pubkey::default()` if there is none yet.
    pub first_price: Pubkey,
    pub attrs:       AttrsMap,
}

impl ProductAccount {
    pub fn new(first_price: Pubkey, attrs: AttrsMap) -> Result<Self, AccountError> {
        let len = attrs.encoded_len();
        if len > PRODUCT_ATTRS_CAPACITY {
            return Err(AccountError::AttrsOverflow {
                len,
                capacity: PRODUCT_ATTRS_CAPACITY,
            });
        }
        Ok(Self {
            header: AccountHeader::new(AccountType::Product, encoded_size(PRODUCT_FIXED_LEN + len)),
            first_price,
            attrs,
        })
    }

    /// Decodes a product account. Only the first `size - 48` bytes of the
    /// attribute region are interpreted; the rest is padding.
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        let mut input = data;
        let header = expect_header(&mut input, data.len(), AccountType::Product)?;
        let (first_price, region) = product_body(&mut input)
            .map_err(|_| truncated(AccountType::Product, data.len()))?;
        let effective_len = usize::try_from(header.size)
            .unwrap_or(usize::MAX)
            .saturating_sub(PRODUCT_FIXED_LEN)
            .min(PRODUCT_ATTRS_CAPACITY);
        let attrs = AttrsMap::decode(region.get(..effective_len).unwrap_or(region))?;
        Ok(Self {
            header,
            first_price,
            attrs,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AccountError> {
        let attrs = self.attrs.encode()?;
        if attrs.len() > PRODUCT_ATTRS_CAPACITY {
            return Err(AccountError::AttrsOverflow {
                len:      attrs.len(),
                capacity: PRODUCT_ATTRS_CAPACITY,
            });
        }
        let mut out = Vec::with_capacity(PRODUCT_ACCOUNT_LEN);
        self.header.write_to(&mut out);
        out.extend_from_slice(self.first_price.as_ref());
        out.extend_from_slice(&attrs);
        out.resize(PRODUCT_ACCOUNT_LEN, 0);
        Ok(out)
    }
}

/// Exponentially-weighted moving average.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ema {
    pub val:   i64,
    pub numer: i64,
    pub denom: i64,
}

impl Ema {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.val.to_le_bytes());
        out.extend_from_slice(&self.numer.to_le_bytes());
        out.extend_from_slice(&self.denom.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PriceStatus {
    #[default]
    Unknown,
    Trading,
    Halted,
    Auction,
}

impl PriceStatus {
    pub fn as_u32(self) -> u32 {
        match self {
            PriceStatus::Unknown => 0,
            PriceStatus::Trading => 1,
            PriceStatus::Halted => 2,
            PriceStatus::Auction => 3,
        }
    }
}

impl From<u32> for PriceStatus {
    fn from(value: u32) -> Self {
        match value {
            1 => PriceStatus::Trading,
            2 => PriceStatus::Halted,
            3 => PriceStatus::Auction,
            _ => PriceStatus::Unknown,
        }
    }
}

/// Price and confidence at a specific slot, either a publisher's
/// contribution or the outcome of aggregation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriceInfo {
    /// Price mantissa, scaled by `10^exponent` of the owning account.
    pub price:    i64,
    pub conf:     u64,
    pub status:   PriceStatus,
    pub corp_act: u32,
    pub pub_slot: u64,
}

impl PriceInfo {
    /// Whether `current` should be reported to a subscriber that last saw
    /// `previous`. Only presence, status and publishing slot count: a price
    /// or confidence change at the same slot and status is not a change.
    pub fn has_changed(previous: Option<&PriceInfo>, current: Option<&PriceInfo>) -> bool {
        match (previous, current) {
            (None, None) => false,
            (Some(previous), Some(current)) => {
                previous.status != current.status || previous.pub_slot != current.pub_slot
            }
            _ => true,
        }
    }

    /// Price and confidence as decimals, `None` unless the price is trading.
    pub fn value(&self, exponent: i32) -> Option<(Decimal, Decimal)> {
        if self.status != PriceStatus::Trading {
            return None;
        }
        Some((
            scale(i128::from(self.price), exponent)?,
            scale(i128::from(self.conf), exponent)?,
        ))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.price.to_le_bytes());
        out.extend_from_slice(&self.conf.to_le_bytes());
        out.extend_from_slice(&self.status.as_u32().to_le_bytes());
        out.extend_from_slice(&self.corp_act.to_le_bytes());
        out.extend_from_slice(&self.pub_slot.to_le_bytes());
    }
}

fn scale(mantissa: i128, exponent: i32) -> Option<Decimal> {
    if exponent <= 0 {
        return Decimal::try_from_i128_with_scale(mantissa, exponent.unsigned_abs()).ok();
    }
    let factor = 10i64.checked_pow(u32::try_from(exponent).ok()?)?;
    Decimal::try_from_i128_with_scale(mantissa, 0)
        .ok()?
        .checked_mul(Decimal::from(factor))
}

/// Price contributed by a single publisher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriceComponent {
    pub publisher: Pubkey,
    /// Price used to compute the current aggregate.
    pub agg:       PriceInfo,
    /// Latest price submitted by the publisher, possibly not yet aggregated.
    pub latest:    PriceInfo,
}

/// Continuously updated price feed of a product.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceAccount {
    pub header:     AccountHeader,
    pub price_type: u32,
    pub exponent:   i32,
    /// Number of component prices.
    pub num:        u32,
    /// Number of quoters that make up the aggregate.
    pub num_qt:     u32,
    /// Slot of the last valid (not unknown) aggregate price.
    pub last_slot:  u64,
    pub valid_slot: u64,
    pub twap:       Ema,
    pub twac:       Ema,
    pub drv1:       i64,
    pub drv2:       i64,
    pub product:    Pubkey,
    /// Next price account of the same product, `Pubkey::default()` at the end.
    pub next:       Pubkey,
    pub prev_slot:  u64,
    pub prev_price: i64,
    pub prev_conf:  u64,
    pub drv3:       i64,
    pub agg:        PriceInfo,
    pub components: [PriceComponent; MAX_COMPONENTS],
}

impl Default for PriceAccount {
    fn default() -> Self {
        Self {
            header:     AccountHeader::new(AccountType::Price, encoded_size(PRICE_ACCOUNT_LEN)),
            price_type: 0,
            exponent:   0,
            num:        0,
            num_qt:     0,
            last_slot:  0,
            valid_slot: 0,
            twap:       Ema::default(),
            twac:       Ema::default(),
            drv1:       0,
            drv2:       0,
            product:    Pubkey::default(),
            next:       Pubkey::default(),
            prev_slot:  0,
            prev_price: 0,
            prev_conf:  0,
            drv3:       0,
            agg:        PriceInfo::default(),
            components: [PriceComponent::default(); MAX_COMPONENTS],
        }
    }
}

impl PriceAccount {
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        let mut input = data;
        let header = expect_header(&mut input, data.len(), AccountType::Price)?;
        price_body(&mut input, header).map_err(|_| truncated(AccountType::Price, data.len()))
    }

    /// Components with a publisher assigned.
    pub fn components(&self) -> impl Iterator<Item = &PriceComponent> {
        self.components
            .iter()
            .filter(|component| component.publisher != Pubkey::default())
    }

    /// First component contributed by `publisher`.
    pub fn component(&self, publisher: &Pubkey) -> Option<&PriceComponent> {
        self.components
            .iter()
            .find(|component| component.publisher == *publisher)
    }

    /// Aggregate price and confidence as decimals, `None` unless trading.
    pub fn value(&self) -> Option<(Decimal, Decimal)> {
        self.agg.value(self.exponent)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRICE_ACCOUNT_LEN);
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.price_type.to_le_bytes());
        out.extend_from_slice(&self.exponent.to_le_bytes());
        out.extend_from_slice(&self.num.to_le_bytes());
        out.extend_from_slice(&self.num_qt.to_le_bytes());
        out.extend_from_slice(&self.last_slot.to_le_bytes());
        out.extend_from_slice(&self.valid_slot.to_le_bytes());
        self.twap.write_to(&mut out);
        self.twac.write_to(&mut out);
        out.extend_from_slice(&self.drv1.to_le_bytes());
        out.extend_from_slice(&self.drv2.to_le_bytes());
        out.extend_from_slice(self.product.as_ref());
        out.extend_from_slice(self.next.as_ref());
        out.extend_from_slice(&self.prev_slot.to_le_bytes());
        out.extend_from_slice(&self.prev_price.to_le_bytes());
        out.extend_from_slice(&self.prev_conf.to_le_bytes());
        out.extend_from_slice(&self.drv3.to_le_bytes());
        self.agg.write_to(&mut out);
        for component in &self.components {
            out.extend_from_slice(component.publisher.as_ref());
            component.agg.write_to(&mut out);
            component.latest.write_to(&mut out);
        }
        out
    }
}

fn encoded_size(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn truncated(account_type: AccountType, actual: usize) -> AccountError {
    AccountError::Truncated {
        account_type,
        expected: account_type.min_len(),
        actual,
    }
}

/// Reads the header and checks it describes a valid account of the expected type.
fn expect_header(
    input: &mut &[u8],
    total_len: usize,
    expected: AccountType,
) -> Result<AccountHeader, AccountError> {
    let header = account_header(input).map_err(|_| truncated(expected, total_len))?;
    if !header.is_valid() {
        return Err(AccountError::InvalidHeader {
            magic:   header.magic,
            version: header.version,
            size:    header.size,
        });
    }
    if header.account_type != expected {
        return Err(AccountError::WrongType {
            expected,
            actual: header.account_type,
        });
    }
    Ok(header)
}

fn u32_le(input: &mut &[u8]) -> ModalResult<u32> {
    le_u32.parse_next(input)
}

fn i32_le(input: &mut &[u8]) -> ModalResult<i32> {
    le_i32.parse_next(input)
}

fn u64_le(input: &mut &[u8]) -> ModalResult<u64> {
    le_u64.parse_next(input)
}

fn i64_le(input: &mut &[u8]) -> ModalResult<i64> {
    le_i64.parse_next(input)
}

pub(crate) fn pubkey(input: &mut &[u8]) -> ModalResult<Pubkey> {
    take(PUBKEY_LEN)
        .try_map(Pubkey::try_from)
        .parse_next(input)
}

fn account_header(input: &mut &[u8]) -> ModalResult<AccountHeader> {
    Ok(AccountHeader {
        magic:        u32_le(input)?,
        version:      u32_le(input)?,
        account_type: AccountType::from(u32_le(input)?),
        size:         u32_le(input)?,
    })
}

fn mapping_body(input: &mut &[u8], header: AccountHeader) -> ModalResult<MappingAccount> {
    let num = u32_le(input)?;
    let unused = u32_le(input)?;
    let next = pubkey(input)?;
    let mut products = Vec::with_capacity(MAPPING_CAPACITY);
    for _ in 0..MAPPING_CAPACITY {
        products.push(pubkey(input)?);
    }
    Ok(MappingAccount {
        header,
        num,
        unused,
        next,
        products,
    })
}

fn product_body<'i>(input: &mut &'i [u8]) -> ModalResult<(Pubkey, &'i [u8])> {
    (pubkey, take(PRODUCT_ATTRS_CAPACITY)).parse_next(input)
}

fn ema(input: &mut &[u8]) -> ModalResult<Ema> {
    Ok(Ema {
        val:   i64_le(input)?,
        numer: i64_le(input)?,
        denom: i64_le(input)?,
    })
}

fn price_info(input: &mut &[u8]) -> ModalResult<PriceInfo> {
    Ok(PriceInfo {
        price:    i64_le(input)?,
        conf:     u64_le(input)?,
        status:   PriceStatus::from(u32_le(input)?),
        corp_act: u32_le(input)?,
        pub_slot: u64_le(input)?,
    })
}

fn price_component(input: &mut &[u8]) -> ModalResult<PriceComponent> {
    Ok(PriceComponent {
        publisher: pubkey(input)?,
        agg:       price_info(input)?,
        latest:    price_info(input)?,
    })
}

fn price_body(input: &mut &[u8], header: AccountHeader) -> ModalResult<PriceAccount> {
    let mut account = PriceAccount {
        header,
        price_type: u32_le(input)?,
        exponent: i32_le(input)?,
        num: u32_le(input)?,
        num_qt: u32_le(input)?,
        last_slot: u64_le(input)?,
        valid_slot: u64_le(input)?,
        twap: ema(input)?,
        twac: ema(input)?,
        drv1: i64_le(input)?,
        drv2: i64_le(input)?,
        product: pubkey(input)?,
        next: pubkey(input)?,
        prev_slot: u64_le(input)?,
        prev_price: i64_le(input)?,
        prev_conf: u64_le(input)?,
        drv3: i64_le(input)?,
        agg: price_info(input)?,
        components: [PriceComponent::default(); MAX_COMPONENTS],
    };
    for component in account.components.iter_mut() {
        *component = price_component(input)?;
    }
    Ok(account)
}
