// ThingsPanel topic conventions and MQTT topic filter rules.

/// Topic a device publishes its online/offline status to.
pub fn status_topic(device_id: &str) -> String {
    format!("devices/status/{device_id}")
}

/// Topic a plugin publishes device telemetry to.
pub fn data_topic(service_identifier: &str, device_id: &str) -> String {
    format!("plugin/{service_identifier}/devices/{device_id}/datas")
}

/// Filter matching downlink commands for every device of a service.
pub fn commands_filter(service_identifier: &str) -> String {
    format!("plugin/{service_identifier}/devices/+/commands")
}

/// Extract the device id from a command topic received through
/// [`commands_filter`].
pub fn command_device_id(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("plugin"), Some(_), Some("devices"), Some(id), Some("commands"), None)
            if !id.is_empty() =>
        {
            Some(id)
        }
        _ => None,
    }
}

/// Check a concrete publish topic: non-empty, no wildcards, no NUL.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic is empty");
    }
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed in a publish topic");
    }
    if topic.contains('\0') {
        return Err("topic contains NUL");
    }
    Ok(())
}

/// Check a subscription filter.
///
/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn validate_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("filter is empty");
    }
    if filter.contains('\0') {
        return Err("filter contains NUL");
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err("'#' must be the entire last level");
        }
        if level.contains('+') && *level != "+" {
            return Err("'+' must be an entire level");
        }
    }
    Ok(())
}

/// Whether `topic` matches the (valid) filter `filter`.
///
/// Topics beginning with `$` are not matched by a leading wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
