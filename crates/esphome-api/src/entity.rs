//! Entities exposed by a device, their states and the commands targeting them.

use crate::proto::{
    BinarySensorStateResponse, ButtonCommandRequest, LightCommandRequest, LightStateResponse,
    ListEntitiesBinarySensorResponse, ListEntitiesButtonResponse, ListEntitiesLightResponse,
    ListEntitiesSensorResponse, ListEntitiesSwitchResponse, ListEntitiesTextSensorResponse, ProtoMessage,
    SensorStateResponse, SwitchCommandRequest, SwitchStateResponse, TextSensorStateResponse, entity_key, object_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    BinarySensor,
    Sensor,
    Switch,
    Button,
    Light,
    TextSensor,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Sensor => "sensor",
            EntityKind::Switch => "switch",
            EntityKind::Button => "button",
            EntityKind::Light => "light",
            EntityKind::TextSensor => "text_sensor",
        }
    }
}

/// An entity as announced in the `ListEntities*Response` messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    BinarySensor(ListEntitiesBinarySensorResponse),
    Sensor(ListEntitiesSensorResponse),
    Switch(ListEntitiesSwitchResponse),
    Button(ListEntitiesButtonResponse),
    Light(ListEntitiesLightResponse),
    TextSensor(ListEntitiesTextSensorResponse),
}

macro_rules! named_constructor {
    ($fn:ident, $variant:ident, $listing:ident) => {
        /// Creates an entity whose object id and key are derived from `name`.
        pub fn $fn(name: impl Into<String>) -> Self {
            let name = name.into();
            let object_id = object_id(&name);

            Self::$variant($listing {
                key: entity_key(&name),
                unique_id: object_id.clone(),
                object_id,
                name,
                ..Default::default()
            })
        }
    };
}

macro_rules! each_entity {
    ($entity:expr, $listing:ident => $body:expr) => {
        match $entity {
            Entity::BinarySensor($listing) => $body,
            Entity::Sensor($listing) => $body,
            Entity::Switch($listing) => $body,
            Entity::Button($listing) => $body,
            Entity::Light($listing) => $body,
            Entity::TextSensor($listing) => $body,
        }
    };
}

impl Entity {
    named_constructor!(binary_sensor, BinarySensor, ListEntitiesBinarySensorResponse);
    named_constructor!(sensor, Sensor, ListEntitiesSensorResponse);
    named_constructor!(switch, Switch, ListEntitiesSwitchResponse);
    named_constructor!(button, Button, ListEntitiesButtonResponse);
    named_constructor!(light, Light, ListEntitiesLightResponse);
    named_constructor!(text_sensor, TextSensor, ListEntitiesTextSensorResponse);

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::BinarySensor(_) => EntityKind::BinarySensor,
            Entity::Sensor(_) => EntityKind::Sensor,
            Entity::Switch(_) => EntityKind::Switch,
            Entity::Button(_) => EntityKind::Button,
            Entity::Light(_) => EntityKind::Light,
            Entity::TextSensor(_) => EntityKind::TextSensor,
        }
    }

    pub fn key(&self) -> u32 {
        each_entity!(self, listing => listing.key)
    }

    pub fn object_id(&self) -> &str {
        each_entity!(self, listing => &listing.object_id)
    }

    pub fn name(&self) -> &str {
        each_entity!(self, listing => &listing.name)
    }

    pub fn unique_id(&self) -> &str {
        each_entity!(self, listing => &listing.unique_id)
    }

    pub fn icon(&self) -> &str {
        each_entity!(self, listing => &listing.icon)
    }

    pub fn to_message(&self) -> ProtoMessage {
        ProtoMessage::from(self.clone())
    }

    /// Whether `command` may target this entity.
    pub fn accepts(&self, command: &Command) -> bool {
        self.key() == command.key()
            && matches!(
                (self, command),
                (Entity::Switch(_), Command::Switch(_))
                    | (Entity::Button(_), Command::Button(_))
                    | (Entity::Light(_), Command::Light(_))
            )
    }
}

impl From<Entity> for ProtoMessage {
    fn from(entity: Entity) -> Self {
        match entity {
            Entity::BinarySensor(listing) => ProtoMessage::ListEntitiesBinarySensorResponse(listing),
            Entity::Sensor(listing) => ProtoMessage::ListEntitiesSensorResponse(listing),
            Entity::Switch(listing) => ProtoMessage::ListEntitiesSwitchResponse(listing),
            Entity::Button(listing) => ProtoMessage::ListEntitiesButtonResponse(listing),
            Entity::Light(listing) => ProtoMessage::ListEntitiesLightResponse(listing),
            Entity::TextSensor(listing) => ProtoMessage::ListEntitiesTextSensorResponse(listing),
        }
    }
}

impl TryFrom<ProtoMessage> for Entity {
    type Error = ProtoMessage;

    fn try_from(message: ProtoMessage) -> Result<Self, Self::Error> {
        match message {
            ProtoMessage::ListEntitiesBinarySensorResponse(listing) => Ok(Entity::BinarySensor(listing)),
            ProtoMessage::ListEntitiesSensorResponse(listing) => Ok(Entity::Sensor(listing)),
            ProtoMessage::ListEntitiesSwitchResponse(listing) => Ok(Entity::Switch(listing)),
            ProtoMessage::ListEntitiesButtonResponse(listing) => Ok(Entity::Button(listing)),
            ProtoMessage::ListEntitiesLightResponse(listing) => Ok(Entity::Light(listing)),
            ProtoMessage::ListEntitiesTextSensorResponse(listing) => Ok(Entity::TextSensor(listing)),
            other => Err(other),
        }
    }
}

/// Latest state of a stateful entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    BinarySensor(BinarySensorStateResponse),
    Sensor(SensorStateResponse),
    Switch(SwitchStateResponse),
    Light(LightStateResponse),
    TextSensor(TextSensorStateResponse),
}

impl EntityState {
    pub fn binary_sensor(key: u32, state: bool) -> Self {
        Self::BinarySensor(BinarySensorStateResponse {
            key,
            state,
            missing_state: false,
        })
    }

    pub fn sensor(key: u32, state: f32) -> Self {
        Self::Sensor(SensorStateResponse {
            key,
            state,
            missing_state: false,
        })
    }

    pub fn switch(key: u32, state: bool) -> Self {
        Self::Switch(SwitchStateResponse { key, state })
    }

    pub fn text_sensor(key: u32, state: impl Into<String>) -> Self {
        Self::TextSensor(TextSensorStateResponse {
            key,
            state: state.into(),
            missing_state: false,
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::BinarySensor(_) => EntityKind::BinarySensor,
            EntityState::Sensor(_) => EntityKind::Sensor,
            EntityState::Switch(_) => EntityKind::Switch,
            EntityState::Light(_) => EntityKind::Light,
            EntityState::TextSensor(_) => EntityKind::TextSensor,
        }
    }

    pub fn key(&self) -> u32 {
        match self {
            EntityState::BinarySensor(state) => state.key,
            EntityState::Sensor(state) => state.key,
            EntityState::Switch(state) => state.key,
            EntityState::Light(state) => state.key,
            EntityState::TextSensor(state) => state.key,
        }
    }

    pub fn to_message(&self) -> ProtoMessage {
        ProtoMessage::from(self.clone())
    }
}

impl From<EntityState> for ProtoMessage {
    fn from(state: EntityState) -> Self {
        match state {
            EntityState::BinarySensor(state) => ProtoMessage::BinarySensorStateResponse(state),
            EntityState::Sensor(state) => ProtoMessage::SensorStateResponse(state),
            EntityState::Switch(state) => ProtoMessage::SwitchStateResponse(state),
            EntityState::Light(state) => ProtoMessage::LightStateResponse(state),
            EntityState::TextSensor(state) => ProtoMessage::TextSensorStateResponse(state),
        }
    }
}

impl TryFrom<ProtoMessage> for EntityState {
    type Error = ProtoMessage;

    fn try_from(message: ProtoMessage) -> Result<Self, Self::Error> {
        match message {
            ProtoMessage::BinarySensorStateResponse(state) => Ok(EntityState::BinarySensor(state)),
            ProtoMessage::SensorStateResponse(state) => Ok(EntityState::Sensor(state)),
            ProtoMessage::SwitchStateResponse(state) => Ok(EntityState::Switch(state)),
            ProtoMessage::LightStateResponse(state) => Ok(EntityState::Light(state)),
            ProtoMessage::TextSensorStateResponse(state) => Ok(EntityState::TextSensor(state)),
            other => Err(other),
        }
    }
}

/// A client request to act on an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Switch(SwitchCommandRequest),
    Button(ButtonCommandRequest),
    Light(LightCommandRequest),
}

impl Command {
    pub fn key(&self) -> u32 {
        match self {
            Command::Switch(command) => command.key,
            Command::Button(command) => command.key,
            Command::Light(command) => command.key,
        }
    }
}

impl From<Command> for ProtoMessage {
    fn from(command: Command) -> Self {
        match command {
            Command::Switch(command) => ProtoMessage::SwitchCommandRequest(command),
            Command::Button(command) => ProtoMessage::ButtonCommandRequest(command),
            Command::Light(command) => ProtoMessage::LightCommandRequest(command),
        }
    }
}

impl TryFrom<ProtoMessage> for Command {
    type Error = ProtoMessage;

    fn try_from(message: ProtoMessage) -> Result<Self, Self::Error> {
        match message {
            ProtoMessage::SwitchCommandRequest(command) => Ok(Command::Switch(command)),
            ProtoMessage::ButtonCommandRequest(command) => Ok(Command::Button(command)),
            ProtoMessage::LightCommandRequest(command) => Ok(Command::Light(command)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::proto::PingRequest;

    #[test]
    fn named_entities_derive_their_ids() {
        let entity = Entity::sensor("My Sensor Name");

        assert_eq!(entity.kind(), EntityKind::Sensor);
        assert_eq!(entity.object_id(), "my_sensor_name");
        assert_eq!(entity.unique_id(), "my_sensor_name");
        assert_eq!(entity.name(), "My Sensor Name");
        assert_eq!(entity.key(), 0x2760_962A);
    }

    #[test]
    fn listing_message_conversions() {
        let entity = Entity::switch("Pump");

        let message = entity.to_message();
        assert!(matches!(message, ProtoMessage::ListEntitiesSwitchResponse(_)));
        assert_eq!(Entity::try_from(message).unwrap(), entity);

        assert!(Entity::try_from(ProtoMessage::from(PingRequest {})).is_err());
    }

    #[test]
    fn commands_only_target_matching_entities() {
        let switch = Entity::switch("Pump");
        let button = Entity::button("Pump");

        let command = Command::Switch(SwitchCommandRequest {
            key: switch.key(),
            state: true,
        });

        assert!(switch.accepts(&command));
        assert!(!button.accepts(&command));
        assert!(!Entity::switch("Other").accepts(&command));
    }

    #[test]
    fn state_conversions() {
        let state = EntityState::sensor(2, 25.0);
        assert_eq!(state.key(), 2);
        assert_eq!(state.kind(), EntityKind::Sensor);
        assert_eq!(EntityState::try_from(state.to_message()).unwrap(), state);

        let command = Command::try_from(ProtoMessage::ButtonCommandRequest(ButtonCommandRequest { key: 9 })).unwrap();
        assert_eq!(command.key(), 9);
    }
}
