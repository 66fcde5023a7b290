use bytes::Bytes;

use snapkv::client::Client;
use snapkv::{Error, DEFAULT_PORT};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let mut client = Client::connect(("127.0.0.1", DEFAULT_PORT)).await?;

    let pong = client.ping(None).await?;
    println!("ping -> {:?}", pong);

    client.set("greeting", Bytes::from("hello")).await?;

    match client.get("greeting").await? {
        Some(value) => println!("greeting -> {:?}", value),
        None => println!("greeting -> (nil)"),
    }

    for key in client.keys("*").await? {
        println!("key: {:?}", key);
    }

    Ok(())
}
