use rust_embed::Embed;

#[derive(Embed)]
#[folder = "asset"]
struct Asset;

pub fn read_file(name: &str) -> String {
    let asset = Asset::get(name).expect("Unable to open asset").data;
    String::from(str::from_utf8(&asset).expect("I/O error"))
}
