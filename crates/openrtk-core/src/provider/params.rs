//! Parameter-table commands.
//!
//! Every handler is one or more synchronous exchanges through the message
//! center and answers with a [`CommandResponse`]; failures never escape as
//! `Err`, so a front-end can forward the result as-is.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::config::{ParamSetting, ms};
use super::response::{CommandResponse, PacketType};
use super::{Provider, ProviderError};
use crate::protocol::mnemonics::{
    GET_ALL_PARAMS, GET_PARAM, GET_PARAM_BLOCK, RESET_DEFAULTS, SAVE_CONFIG, UPDATE_PARAM,
};
use crate::protocol::{
    CMD_SET_PARAMS, Command, FrameError, PARAM_PAGE_FIRST_ID, PARAM_PAGE_SIZE, ParamDescriptor,
    decode_value, encode_value, mnemonic_id,
};
use crate::transport::Communicator;

/// One decoded parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamValue {
    pub param_id: u32,
    pub name: String,
    pub value: Value,
}

/// Decode back-to-back `paramId u32 LE + value` records.
pub fn decode_records(payload: &[u8], table: &[ParamDescriptor]) -> Result<Vec<ParamValue>, FrameError> {
    let mut records = Vec::new();
    let mut rest = payload;

    while rest.len() >= 4 {
        let param_id = LittleEndian::read_u32(rest);
        let descriptor = table
            .iter()
            .find(|p| p.param_id == param_id)
            .ok_or_else(|| FrameError::UnknownCommand(format!("paramId {param_id}")))?;
        let (value, width) = decode_value(&descriptor.ty, &rest[4..])?;
        records.push(ParamValue {
            param_id,
            name: descriptor.name.clone(),
            value,
        });
        rest = &rest[4 + width..];
    }

    if !rest.is_empty() {
        debug!(trailing = rest.len(), "Ignoring trailing bytes after parameter records");
    }
    Ok(records)
}

/// Status word of a set/save answer. Missing status reads as success.
pub fn status_code(payload: &[u8]) -> i64 {
    match payload.len() {
        0 => 0,
        1..=3 => payload[0] as i64,
        _ => LittleEndian::read_i32(payload) as i64,
    }
}

/// Inclusive `[start, end]` id ranges requested page by page. The last id
/// requested is `count - 1`.
fn param_pages(count: u32) -> Vec<(u32, u32)> {
    let last = count.saturating_sub(1);
    (PARAM_PAGE_FIRST_ID..last)
        .step_by(PARAM_PAGE_SIZE as usize)
        .map(|start| {
            let end = if start + PARAM_PAGE_SIZE < last {
                start + PARAM_PAGE_SIZE - 1
            } else {
                last
            };
            (start, end)
        })
        .collect()
}

impl<C: Communicator + 'static> Provider<C> {
    fn table(&self) -> &[ParamDescriptor] {
        &self.properties.user_configuration
    }

    fn uses_paged_params(&self) -> bool {
        self.app_info().is_some_and(|app| app.app_name == "INS")
    }

    fn query(&self, command: &Command, timeout: Duration) -> Result<Vec<u8>, CommandResponse> {
        self.center
            .build(command, timeout)
            .map(|result| result.payload)
            .map_err(|e| CommandResponse::from_exchange_error(&e))
    }

    fn framing_error(e: impl Into<ProviderError>) -> CommandResponse {
        let e = e.into();
        warn!(error = %e, "Command not framed");
        CommandResponse::error(json!({ "error": e.to_string() }))
    }

    /// Read the whole parameter table.
    #[instrument(skip(self))]
    pub fn get_params(&self) -> CommandResponse {
        match self.read_params() {
            Ok(values) => CommandResponse::new(PacketType::InputParams, json!(values)),
            Err(response) => response,
        }
    }

    fn read_params(&self) -> Result<Vec<ParamValue>, CommandResponse> {
        if !self.uses_paged_params() {
            let command = self
                .framer
                .input(GET_ALL_PARAMS, None, None, None)
                .map_err(Self::framing_error)?;
            let payload = self.query(&command, ms(self.config.bulk_params_timeout_ms))?;
            return decode_records(&payload, self.table()).map_err(Self::framing_error);
        }

        let id = mnemonic_id(GET_PARAM_BLOCK).map_err(Self::framing_error)?;
        let count = u32::try_from(self.table().len()).unwrap_or(u32::MAX);
        let mut values = Vec::new();
        for (start, end) in param_pages(count) {
            let mut payload = start.to_le_bytes().to_vec();
            payload.extend_from_slice(&end.to_le_bytes());
            let command = self.framer.command(id, &payload).map_err(Self::framing_error)?;
            let answer = self.query(&command, ms(self.config.paged_params_timeout_ms))?;
            let page = decode_records(&answer, self.table()).map_err(Self::framing_error)?;
            debug!(start, end, received = page.len(), "Parameter page read");
            values.extend(page);
        }
        Ok(values)
    }

    /// Read one parameter.
    pub fn get_param(&self, param_id: u32) -> CommandResponse {
        let command = match self.framer.input(GET_PARAM, None, Some(param_id), None) {
            Ok(command) => command,
            Err(e) => return Self::framing_error(e),
        };
        let payload = match self.query(&command, self.config.command_timeout()) {
            Ok(payload) => payload,
            Err(response) => return response,
        };
        match decode_records(&payload, self.table()) {
            Ok(values) => match values.into_iter().find(|v| v.param_id == param_id) {
                Some(value) => CommandResponse::new(PacketType::InputParam, json!(value)),
                None => CommandResponse::error(json!({ "error": "parameter missing from answer", "paramId": param_id })),
            },
            Err(e) => Self::framing_error(e),
        }
    }

    /// Write one parameter; the value is encoded with its declared type.
    pub fn set_param(&self, param_id: u32, value: &Value) -> CommandResponse {
        let command = match self.framer.input(UPDATE_PARAM, Some(self.table()), Some(param_id), Some(value)) {
            Ok(command) => command,
            Err(e) => return Self::framing_error(e),
        };
        self.status_exchange(&command, self.config.command_timeout())
    }

    /// Write several parameters, one packet per category in first-seen order.
    /// Stops at the first group the device refuses.
    #[instrument(skip_all, fields(count = settings.len()))]
    pub fn set_params(&self, settings: &[ParamSetting]) -> CommandResponse {
        let groups = match self.group_by_category(settings) {
            Ok(groups) => groups,
            Err(e) => return Self::framing_error(e),
        };

        for (category, payload) in groups {
            let command = match self.framer.command(CMD_SET_PARAMS, &payload) {
                Ok(command) => command,
                Err(e) => return Self::framing_error(e),
            };
            let answer = match self.query(&command, self.config.command_timeout()) {
                Ok(answer) => answer,
                Err(response) => return response,
            };
            let status = answer.first().copied().unwrap_or(0);
            if status > 0 {
                warn!(category = %category, status, "Parameter group rejected");
                return CommandResponse::device_error(status as i64);
            }
            debug!(category = %category, "Parameter group written");
        }
        CommandResponse::success(json!({ "error": 0 }))
    }

    fn group_by_category(&self, settings: &[ParamSetting]) -> Result<Vec<(String, Vec<u8>)>, FrameError> {
        let mut groups: Vec<(String, Vec<u8>)> = Vec::new();
        for setting in settings {
            let descriptor = self
                .properties
                .descriptor(setting.param_id)
                .ok_or_else(|| FrameError::UnknownCommand(format!("paramId {}", setting.param_id)))?;
            let id = i8::try_from(setting.param_id).map_err(|_| FrameError::InvalidValue {
                ty: "int8".into(),
                value: setting.param_id.to_string(),
            })?;

            let index = match groups.iter().position(|(c, _)| *c == descriptor.category) {
                Some(index) => index,
                None => {
                    groups.push((descriptor.category.clone(), Vec::new()));
                    groups.len() - 1
                }
            };
            let payload = &mut groups[index].1;
            payload.push(id as u8);
            payload.extend(encode_value(&descriptor.ty, &setting.value)?);
        }
        Ok(groups)
    }

    /// Persist the current parameters.
    pub fn save_config(&self) -> CommandResponse {
        self.mnemonic_status(SAVE_CONFIG)
    }

    /// Restore factory parameters.
    pub fn reset_params(&self) -> CommandResponse {
        self.mnemonic_status(RESET_DEFAULTS)
    }

    fn mnemonic_status(&self, mnemonic: &str) -> CommandResponse {
        match self.framer.input(mnemonic, None, None, None) {
            Ok(command) => self.status_exchange(&command, ms(self.config.save_timeout_ms)),
            Err(e) => Self::framing_error(e),
        }
    }

    fn status_exchange(&self, command: &Command, timeout: Duration) -> CommandResponse {
        match self.query(command, timeout) {
            Ok(payload) => match status_code(&payload) {
                0 => CommandResponse::success(json!({ "error": 0 })),
                code => CommandResponse::device_error(code),
            },
            Err(response) => response,
        }
    }

    /// Send an already framed command and return the raw answer.
    pub fn send_command(&self, command: &Command) -> CommandResponse {
        match self.query(command, ms(self.config.send_command_timeout_ms)) {
            Ok(payload) => CommandResponse::success(json!(payload)),
            Err(response) => response,
        }
    }

    pub fn server_status(&self) -> CommandResponse {
        CommandResponse::new(PacketType::Ping, json!({ "status": "1" }))
    }

    /// Output packet list and parameter table from the device configuration.
    pub fn get_conf(&self) -> CommandResponse {
        CommandResponse::new(
            PacketType::Conf,
            json!({
                "outputs": self.properties.user_messages.output_packets,
                "inputParams": self.properties.user_configuration,
            }),
        )
    }

    /// Identification bound with [`bind_device_info`](Self::bind_device_info).
    pub fn get_device_info(&self) -> CommandResponse {
        match (self.device_info(), self.app_info()) {
            (Some(device), Some(app)) => CommandResponse::new(
                PacketType::DeviceInfo,
                json!([
                    { "name": "Product Name", "value": device.name },
                    { "name": "PN", "value": device.pn },
                    { "name": "SN", "value": device.sn },
                    { "name": "Firmware", "value": app.version },
                ]),
            ),
            _ => CommandResponse::error(json!({ "error": "device not bound" })),
        }
    }

    /// Write `initial.userParameters` and persist them.
    pub fn apply_user_parameters(&self) -> CommandResponse {
        let settings = &self.properties.initial.user_parameters;
        if settings.is_empty() {
            return CommandResponse::success(json!({ "error": 0 }));
        }
        let response = self.set_params(settings);
        if !response.is_success() {
            return response;
        }
        self.save_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::engine::PausePolicy;
    use crate::events::NullObserver;
    use crate::protocol::{PacketDecoder, PacketLayout};
    use crate::provider::{DeviceProperties, ProviderConfig};
    use crate::transport::MockCommunicator;

    fn descriptor(id: u32, category: &str, name: &str, ty: &str) -> ParamDescriptor {
        ParamDescriptor {
            param_id: id,
            category: category.into(),
            name: name.into(),
            ty: ty.into(),
        }
    }

    fn properties() -> DeviceProperties {
        DeviceProperties {
            user_configuration: vec![
                descriptor(1, "", "Data CRC", "uint64"),
                descriptor(2, "lever", "Lever arm x", "float"),
                descriptor(3, "lever", "Lever arm y", "float"),
                descriptor(4, "rotation", "Rotation x", "float"),
                descriptor(5, "lever", "Lever arm z", "float"),
                descriptor(6, "", "Port", "uint16"),
            ],
            ..Default::default()
        }
    }

    fn provider(mock: &Arc<MockCommunicator>) -> Provider<MockCommunicator> {
        let config = ProviderConfig {
            command_timeout_ms: 300,
            pause_policy: PausePolicy::Reject,
            ..ProviderConfig::without_delays()
        };
        let provider = Provider::with_observer(Arc::clone(mock), config, properties(), Arc::new(NullObserver));
        provider.start().unwrap();
        provider
    }

    fn record(id: u32, value: &[u8]) -> Vec<u8> {
        let mut out = id.to_le_bytes().to_vec();
        out.extend_from_slice(value);
        out
    }

    fn written_payloads(mock: &MockCommunicator) -> Vec<Vec<u8>> {
        let mut decoder = PacketDecoder::new(PacketLayout::Ethernet);
        mock.get_writes()
            .iter()
            .flat_map(|w| decoder.push(w))
            .map(|p| p.payload)
            .collect()
    }

    #[test]
    fn test_decode_records_and_status() {
        let mut payload = record(2, &1.5f32.to_le_bytes());
        payload.extend(record(6, &[0x10, 0x27]));
        let values = decode_records(&payload, &properties().user_configuration).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, json!(1.5));
        assert_eq!(values[1].name, "Port");
        assert_eq!(values[1].value, json!(10000));

        assert!(decode_records(&record(99, &[0]), &properties().user_configuration).is_err());
        assert_eq!(status_code(&[]), 0);
        assert_eq!(status_code(&[3]), 3);
        assert_eq!(status_code(&(-1i32).to_le_bytes()), -1);
    }

    #[test]
    fn test_param_pages() {
        assert_eq!(param_pages(6), vec![(2, 5)]);
        assert_eq!(param_pages(12), vec![(2, 11)]);
        assert_eq!(param_pages(14), vec![(2, 11), (12, 13)]);
        assert_eq!(param_pages(25), vec![(2, 11), (12, 21), (22, 24)]);
        assert!(param_pages(2).is_empty());
        assert!(param_pages(0).is_empty());
    }

    #[test]
    fn test_get_params_bulk() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(*b"gA", &record(6, &[0x01, 0x00]));
        let provider = provider(&mock);

        let response = provider.get_params();
        assert_eq!(response.packet_type, PacketType::InputParams);
        assert_eq!(response.data[0]["paramId"], 6);
        assert_eq!(response.data[0]["value"], 1);
        assert_eq!(mock.written_ids(), vec![*b"gA"]);
        provider.close();
    }

    #[test]
    fn test_get_params_paged_for_ins_app() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(*b"gB", &record(2, &2.0f32.to_le_bytes()));
        let provider = provider(&mock);
        provider
            .bind_device_info("INS401 1 2", "INS 2.0.0, Bootloader")
            .unwrap();

        let response = provider.get_params();
        assert!(response.is_success());
        assert_eq!(mock.written_ids(), vec![*b"gB"]);
        let request = &written_payloads(&mock)[0];
        assert_eq!(&request[..4], &2u32.to_le_bytes());
        assert_eq!(&request[4..], &5u32.to_le_bytes());
        provider.close();
    }

    #[test]
    fn test_get_param_timeout_reports_no_response() {
        let mock = Arc::new(MockCommunicator::ethernet());
        let provider = provider(&mock);

        let response = provider.get_param(2);
        assert_eq!(response.packet_type, PacketType::Error);
        assert_eq!(response.data["kind"], "noResponse");

        mock.respond_to(*b"gP", &record(2, &0.25f32.to_le_bytes()));
        let response = provider.get_param(2);
        assert_eq!(response.packet_type, PacketType::InputParam);
        assert_eq!(response.data["name"], "Lever arm x");
        provider.close();
    }

    #[test]
    fn test_set_param_status() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(*b"uP", &0i32.to_le_bytes());
        mock.respond_to(*b"uP", &5i32.to_le_bytes());
        let provider = provider(&mock);

        assert!(provider.set_param(6, &json!(2000)).is_success());
        let rejected = provider.set_param(6, &json!(2000));
        assert_eq!(rejected.data["error"], 5);

        let payload = &written_payloads(&mock)[0];
        assert_eq!(payload, &[6, 0, 0, 0, 0xD0, 0x07]);

        assert!(!provider.set_param(42, &json!(1)).is_success());
        provider.close();
    }

    #[test]
    fn test_set_params_groups_by_category() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(CMD_SET_PARAMS, &[0]);
        mock.respond_to(CMD_SET_PARAMS, &[0]);
        let provider = provider(&mock);

        let settings = vec![
            ParamSetting { param_id: 2, value: json!(1.0) },
            ParamSetting { param_id: 4, value: json!(0.5) },
            ParamSetting { param_id: 5, value: json!(2.0) },
        ];
        assert!(provider.set_params(&settings).is_success());

        let payloads = written_payloads(&mock);
        assert_eq!(payloads.len(), 2);
        let mut lever = vec![2];
        lever.extend(1.0f32.to_le_bytes());
        lever.push(5);
        lever.extend(2.0f32.to_le_bytes());
        assert_eq!(payloads[0], lever);
        assert_eq!(payloads[1][0], 4);
        provider.close();
    }

    #[test]
    fn test_set_params_stops_at_rejected_group() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(CMD_SET_PARAMS, &[2]);
        let provider = provider(&mock);

        let settings = vec![
            ParamSetting { param_id: 2, value: json!(1.0) },
            ParamSetting { param_id: 4, value: json!(0.5) },
        ];
        let response = provider.set_params(&settings);
        assert_eq!(response.data["error"], 2);
        assert_eq!(mock.written_ids().len(), 1);
        provider.close();
    }

    #[test]
    fn test_commands_rejected_while_paused() {
        let mock = Arc::new(MockCommunicator::ethernet());
        mock.respond_to(*b"sC", &[0]);
        let provider = provider(&mock);

        provider.center().pause();
        assert_eq!(provider.save_config().data["kind"], "paused");
        provider.center().resume();
        assert!(provider.save_config().is_success());
        provider.close();
    }

    #[test]
    fn test_static_answers() {
        let mock = Arc::new(MockCommunicator::ethernet());
        let provider = provider(&mock);

        assert_eq!(provider.server_status().data["status"], "1");
        let conf = provider.get_conf();
        assert_eq!(conf.packet_type, PacketType::Conf);
        assert_eq!(conf.data["inputParams"].as_array().unwrap().len(), 6);
        assert!(!provider.get_device_info().is_success());
        provider.close();
    }
}
