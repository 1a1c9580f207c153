use {
    super::{
        attrs::AttrsMap,
        instruction::{
            Command,
            Instruction,
            PriceSetup,
            Publisher,
            SetMinPub,
            UpdPrice,
            UpdTest,
        },
    },
    solana_sdk::{
        instruction::AccountMeta,
        pubkey::Pubkey,
        sysvar,
    },
};

/// Builds oracle program instructions with the account lists the program
/// expects.
///
/// The funding account always comes first and signs. Accounts being created
/// or modified by the instruction sign as well, except for price updates
/// where only the publisher signs and the clock sysvar is passed read-only.
#[derive(Clone, Copy, Debug)]
pub struct InstructionBuilder {
    program_id: Pubkey,
}

impl InstructionBuilder {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    fn signed(&self, funding: Pubkey, keys: &[Pubkey], command: Command) -> Instruction {
        let accounts = std::iter::once(funding)
            .chain(keys.iter().copied())
            .map(|key| AccountMeta::new(key, true))
            .collect();
        Instruction::new(self.program_id, accounts, command)
    }

    fn price_update(&self, funding: Pubkey, price: Pubkey, command: Command) -> Instruction {
        Instruction::new(
            self.program_id,
            vec![
                AccountMeta::new(funding, true),
                AccountMeta::new(price, false),
                AccountMeta::new_readonly(sysvar::clock::id(), false),
            ],
            command,
        )
    }

    pub fn init_mapping(&self, funding: Pubkey, mapping: Pubkey) -> Instruction {
        self.signed(funding, &[mapping], Command::InitMapping)
    }

    pub fn add_mapping(&self, funding: Pubkey, tail_mapping: Pubkey, new_mapping: Pubkey) -> Instruction {
        self.signed(funding, &[tail_mapping, new_mapping], Command::AddMapping)
    }

    pub fn add_product(&self, funding: Pubkey, mapping: Pubkey, product: Pubkey) -> Instruction {
        self.signed(funding, &[mapping, product], Command::AddProduct)
    }

    pub fn upd_product(&self, funding: Pubkey, product: Pubkey, attrs: AttrsMap) -> Instruction {
        self.signed(funding, &[product], Command::UpdProduct(attrs))
    }

    pub fn add_price(
        &self,
        funding: Pubkey,
        product: Pubkey,
        price: Pubkey,
        setup: PriceSetup,
    ) -> Instruction {
        self.signed(funding, &[product, price], Command::AddPrice(setup))
    }

    pub fn add_publisher(&self, funding: Pubkey, price: Pubkey, publisher: Publisher) -> Instruction {
        self.signed(funding, &[price], Command::AddPublisher(publisher))
    }

    pub fn del_publisher(&self, funding: Pubkey, price: Pubkey, publisher: Publisher) -> Instruction {
        self.signed(funding, &[price], Command::DelPublisher(publisher))
    }

    pub fn upd_price(&self, funding: Pubkey, price: Pubkey, update: UpdPrice) -> Instruction {
        self.price_update(funding, price, Command::UpdPrice(update))
    }

    pub fn upd_price_no_fail_on_error(
        &self,
        funding: Pubkey,
        price: Pubkey,
        update: UpdPrice,
    ) -> Instruction {
        self.price_update(funding, price, Command::UpdPriceNoFailOnError(update))
    }

    pub fn agg_price(&self, funding: Pubkey, price: Pubkey) -> Instruction {
        self.price_update(funding, price, Command::AggPrice)
    }

    pub fn init_price(&self, funding: Pubkey, price: Pubkey, setup: PriceSetup) -> Instruction {
        self.signed(funding, &[price], Command::InitPrice(setup))
    }

    pub fn init_test(&self, funding: Pubkey, test: Pubkey) -> Instruction {
        self.signed(funding, &[test], Command::InitTest)
    }

    pub fn upd_test(&self, funding: Pubkey, test: Pubkey, update: UpdTest) -> Instruction {
        self.signed(funding, &[test], Command::UpdTest(Box::new(update)))
    }

    pub fn set_min_pub(&self, funding: Pubkey, price: Pubkey, min_pub: SetMinPub) -> Instruction {
        self.signed(funding, &[price], Command::SetMinPub(min_pub))
    }
}
