fn main() {
    // ESP-IDF environment is only needed for the firmware build; host builds
    // and tests skip it.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("xtensa") || target.ends_with("-espidf") {
        embuild::espidf::sysenv::output();
    }
}
