use vellum::{AggregateId, AggregateState, Apply, Versioned};

#[derive(Debug, Clone, Versioned)]
#[versioned(name = "shipment-dispatched", version = 1)]
pub struct Dispatched {
    pub carrier: String,
}

#[derive(Default, AggregateState)]
#[aggregate(id = AggregateId, kind = "shipment", events(Dispatched))]
pub struct ShipmentState {
    carrier: Option<String>,
}

impl Apply<Dispatched> for ShipmentState {
    fn apply(&mut self, event: &Dispatched) {
        self.carrier = Some(event.carrier.clone());
    }
}

fn main() {
    assert_eq!(<ShipmentState as AggregateState>::KIND, "shipment");
    assert!(ShipmentState::dispatch_table().handles::<Dispatched>());
}
