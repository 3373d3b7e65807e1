use vellum::{AggregateState, Versioned};

#[derive(Debug, Versioned)]
pub struct Tagged;

#[derive(AggregateState)]
#[aggregate(id = String, events(Tagged))]
pub struct Labels<const N: usize>;

fn main() {
    let _ = (Tagged, Labels::<3>);
}
