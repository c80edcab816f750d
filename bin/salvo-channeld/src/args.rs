use argh::FromArgs;

#[derive(Debug, Clone, FromArgs)]
#[argh(description = "salvo channel daemon")]
pub struct Args {
    #[argh(
        option,
        description = "game namespace id",
        default = "String::from(\"xs\")"
    )]
    pub game_id: String,

    #[argh(option, description = "hex id of the channel to manage")]
    pub channel_id: String,

    #[argh(option, description = "name of the player running this daemon")]
    pub player_name: String,

    #[argh(option, description = "url of the channel GSP RPC")]
    pub gsp_rpc_url: String,

    #[argh(
        option,
        description = "url of the wallet RPC used to submit on-chain moves"
    )]
    pub wallet_rpc_url: String,

    #[argh(option, description = "url of the off-chain broadcast RPC")]
    pub broadcast_rpc_url: String,

    #[argh(
        option,
        description = "host to bind the daemon RPC server on",
        default = "String::from(\"127.0.0.1\")"
    )]
    pub rpc_host: String,

    #[argh(
        option,
        description = "port to bind the daemon RPC server on",
        default = "8900"
    )]
    pub rpc_port: u16,

    #[argh(
        option,
        description = "hex-encoded secp256k1 secret key for channel signatures"
    )]
    pub signing_key: String,
}
