pub const TOPIC_PELLET_LEVEL: &str = "hopper/pellets/level";
pub const TOPIC_PELLET_TYPE: &str = "hopper/pellets/type";
pub const TOPIC_SENSOR_BATTERY: &str = "hopper/sensor/battery";

pub const MQTT_CLIENT_ID: &str = "hopperhawk";
pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
