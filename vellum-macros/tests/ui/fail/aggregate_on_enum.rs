use vellum::{AggregateState, Versioned};

#[derive(Debug, Versioned)]
pub struct FundsDeposited;

#[derive(AggregateState)]
#[aggregate(id = String, events(FundsDeposited))]
pub enum Account {
    Active,
    Closed,
}

fn main() {
    let _ = (FundsDeposited, Account::Active, Account::Closed);
}
