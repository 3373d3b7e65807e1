use vellum::Versioned;

#[derive(Debug, Versioned)]
#[versioned(name = "renamed", upgrade = Renamed)]
pub struct RenamedV1;

#[derive(Debug, Versioned)]
#[versioned(name = "renamed", version = 2)]
pub struct Renamed;

impl From<&RenamedV1> for Renamed {
    fn from(_: &RenamedV1) -> Self {
        Self
    }
}

fn main() {
    let _ = (RenamedV1, Renamed);
}
