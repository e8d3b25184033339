fn main() {
    println!("cargo:rerun-if-changed=web");

    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
