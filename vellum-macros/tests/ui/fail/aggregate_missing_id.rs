use vellum::{AggregateState, Versioned};

#[derive(Debug, Versioned)]
pub struct Opened;

#[derive(AggregateState)]
#[aggregate(events(Opened))]
pub struct Account;

fn main() {
    let _ = (Opened, Account);
}
