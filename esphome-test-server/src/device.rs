//! Applies client commands and drives the sensor.

use std::time::Duration;

use esphome_api::proto::{LightCommandRequest, LightStateResponse, LogLevel};
use esphome_api::{Command, EntityState, ServerEvent, ServerHandle};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{INITIAL_SENSOR_VALUE, SENSOR_KEY};

const SENSOR_STEP: f32 = 0.5;

pub(crate) struct Device {
    handle: ServerHandle,
    sensor_value: f32,
}

impl Device {
    pub(crate) fn new(handle: ServerHandle) -> Self {
        Self {
            handle,
            sensor_value: INITIAL_SENSOR_VALUE,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        sensor_interval: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + sensor_interval, sensor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.step_sensor()?,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event)?,
                    None => break,
                },
            }
        }

        Ok(())
    }

    fn step_sensor(&mut self) -> anyhow::Result<()> {
        self.sensor_value += SENSOR_STEP;
        trace!(value = self.sensor_value, "Sensor update");
        self.handle.publish_state(EntityState::sensor(SENSOR_KEY, self.sensor_value))?;
        Ok(())
    }

    fn on_event(&mut self, event: ServerEvent) -> anyhow::Result<()> {
        match event {
            ServerEvent::Connected { peer_addr } => info!(%peer_addr, "Client connected"),
            ServerEvent::Disconnected { peer_addr } => info!(%peer_addr, "Client disconnected"),
            ServerEvent::Command { command, .. } => self.apply(command)?,
        }

        Ok(())
    }

    fn apply(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Switch(command) => {
                info!(state = command.state, "Switch turned {}", if command.state { "on" } else { "off" });
                self.handle.publish_state(EntityState::switch(command.key, command.state))?;
            }
            Command::Button(command) => {
                info!(key = command.key, "Button pressed");
                self.handle.publish_log(LogLevel::Info, "Button pressed");
            }
            Command::Light(command) => {
                let state = self.light_state(&command);
                info!(on = state.state, brightness = state.brightness, "Light updated");
                self.handle.publish_state(EntityState::Light(state))?;
            }
        }

        Ok(())
    }

    fn light_state(&self, command: &LightCommandRequest) -> LightStateResponse {
        let mut state = match self.handle.state(command.key) {
            Some(EntityState::Light(state)) => state,
            _ => LightStateResponse {
                key: command.key,
                ..Default::default()
            },
        };

        if command.has_state {
            state.state = command.state;
        }

        if command.has_brightness {
            state.brightness = command.brightness.clamp(0.0, 1.0);
        }

        state
    }
}
