use vellum::AggregateState;

#[derive(AggregateState)]
#[aggregate(id = String, events())]
pub struct Account;

fn main() {
    let _ = Account;
}
