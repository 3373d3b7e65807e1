use vellum::{AggregateRoot, AggregateState, Apply, Versioned};

#[derive(Debug, Versioned)]
pub struct FundsDeposited {
    pub amount: i64,
}

#[derive(Debug, Versioned)]
#[versioned(name = "funds-withdrawn")]
pub struct Withdrawal {
    pub amount: i64,
}

#[derive(Default, AggregateState)]
#[aggregate(id = String, events(FundsDeposited, Withdrawal))]
pub struct Account {
    balance: i64,
}

impl Apply<FundsDeposited> for Account {
    fn apply(&mut self, event: &FundsDeposited) {
        self.balance += event.amount;
    }
}

impl Apply<Withdrawal> for Account {
    fn apply(&mut self, event: &Withdrawal) {
        self.balance -= event.amount;
    }
}

fn main() {
    assert_eq!(<Account as AggregateState>::KIND, "account");
    assert_eq!(<Withdrawal as Versioned>::NAME, "funds-withdrawn");

    let root = AggregateRoot::<Account>::new("acct-1".to_string());
    root.emit(FundsDeposited { amount: 10 }).unwrap();
    root.emit(Withdrawal { amount: 3 }).unwrap();
    assert_eq!(root.read_state(|s| s.balance), 7);
}
