use uuid::Uuid;

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer(Uuid),
    Technician(Uuid),
    Admin(Uuid),
}

impl Actor {
    pub fn id(&self) -> Uuid {
        match self {
            Actor::Customer(id) | Actor::Technician(id) | Actor::Admin(id) => *id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}
