//! Solidity bindings for the supported protocols.

#![allow(missing_docs)]

use alloy_sol_types::sol;

sol! {
    /// Seaport 1.5/1.6 events.
    #[sol(all_derives)]
    interface ISeaport {
        struct SpentItem {
            uint8 itemType;
            address token;
            uint256 identifier;
            uint256 amount;
        }

        struct ReceivedItem {
            uint8 itemType;
            address token;
            uint256 identifier;
            uint256 amount;
            address recipient;
        }

        event OrderFulfilled(
            bytes32 orderHash,
            address indexed offerer,
            address indexed zone,
            address recipient,
            SpentItem[] offer,
            ReceivedItem[] consideration
        );

        event OrderCancelled(bytes32 orderHash, address indexed offerer, address indexed zone);

        event CounterIncremented(uint256 newCounter, address indexed offerer);
    }
}

sol! {
    /// Payment Processor v2 events and sale entry points.
    #[sol(all_derives)]
    interface IPaymentProcessor {
        struct Order {
            uint8 protocol;
            address maker;
            address beneficiary;
            address marketplace;
            address fallbackRoyaltyRecipient;
            address paymentMethod;
            address tokenAddress;
            uint256 tokenId;
            uint256 amount;
            uint256 itemPrice;
            uint256 nonce;
            uint256 expiration;
            uint256 marketplaceFeeNumerator;
            uint256 maxRoyaltyFeeNumerator;
            uint256 requestedFillAmount;
            uint256 minimumFillAmount;
        }

        struct SignatureECDSA {
            uint8 v;
            bytes32 r;
            bytes32 s;
        }

        struct Cosignature {
            address signer;
            address taker;
            uint256 expiration;
            uint8 v;
            bytes32 r;
            bytes32 s;
        }

        struct FeeOnTop {
            address recipient;
            uint256 amount;
        }

        struct TokenSetProof {
            bytes32 rootHash;
            bytes32[] proof;
        }

        struct SweepOrder {
            uint8 protocol;
            address tokenAddress;
            address paymentMethod;
            address beneficiary;
        }

        struct SweepItem {
            address maker;
            address marketplace;
            address fallbackRoyaltyRecipient;
            uint256 tokenId;
            uint256 amount;
            uint256 itemPrice;
            uint256 nonce;
            uint256 expiration;
            uint256 marketplaceFeeNumerator;
            uint256 maxRoyaltyFeeNumerator;
        }

        event BuyListingERC721(
            address indexed buyer,
            address indexed seller,
            address indexed tokenAddress,
            address beneficiary,
            address paymentCoin,
            uint256 tokenId,
            uint256 salePrice
        );

        event BuyListingERC1155(
            address indexed buyer,
            address indexed seller,
            address indexed tokenAddress,
            address beneficiary,
            address paymentCoin,
            uint256 tokenId,
            uint256 amount,
            uint256 salePrice
        );

        event AcceptOfferERC721(
            address indexed seller,
            address indexed buyer,
            address indexed tokenAddress,
            address beneficiary,
            address paymentCoin,
            uint256 tokenId,
            uint256 salePrice
        );

        event AcceptOfferERC1155(
            address indexed seller,
            address indexed buyer,
            address indexed tokenAddress,
            address beneficiary,
            address paymentCoin,
            uint256 tokenId,
            uint256 amount,
            uint256 salePrice
        );

        event NonceInvalidated(uint256 indexed nonce, address indexed account, bool wasCancellation);

        event MasterNonceInvalidated(address indexed account, uint256 nonce);

        function buyListing(
            bytes32 domainSeparator,
            Order saleDetails,
            SignatureECDSA sellerSignature,
            FeeOnTop feeOnTop
        ) external payable;

        function buyListingCosigned(
            bytes32 domainSeparator,
            Order saleDetails,
            SignatureECDSA sellerSignature,
            Cosignature cosignature,
            FeeOnTop feeOnTop
        ) external payable;

        function bulkBuyListings(
            bytes32 domainSeparator,
            Order[] saleDetailsArray,
            SignatureECDSA[] sellerSignatures,
            FeeOnTop[] feesOnTop
        ) external payable;

        function bulkBuyListingsCosigned(
            bytes32 domainSeparator,
            Order[] saleDetailsArray,
            SignatureECDSA[] sellerSignatures,
            Cosignature[] cosignatures,
            FeeOnTop[] feesOnTop
        ) external payable;

        function sweepCollection(
            bytes32 domainSeparator,
            FeeOnTop feeOnTop,
            SweepOrder sweepOrder,
            SweepItem[] items,
            SignatureECDSA[] signedSellOrders
        ) external payable;

        function sweepCollectionCosigned(
            bytes32 domainSeparator,
            FeeOnTop feeOnTop,
            SweepOrder sweepOrder,
            SweepItem[] items,
            SignatureECDSA[] signedSellOrders,
            Cosignature[] cosignatures
        ) external payable;

        function acceptOffer(
            bytes32 domainSeparator,
            bool isCollectionLevelOffer,
            Order saleDetails,
            SignatureECDSA buyerSignature,
            TokenSetProof tokenSetProof,
            Cosignature cosignature,
            FeeOnTop feeOnTop
        ) external payable;

        function bulkAcceptOffers(
            bytes32 domainSeparator,
            bool[] isCollectionLevelOfferArray,
            Order[] saleDetailsArray,
            SignatureECDSA[] buyerSignaturesArray,
            TokenSetProof[] tokenSetProofsArray,
            Cosignature[] cosignaturesArray,
            FeeOnTop[] feesOnTopArray
        ) external payable;
    }
}

sol! {
    /// EIP-712 listing approval signed by Payment Processor sellers.
    #[sol(all_derives)]
    struct SaleApproval {
        uint8 protocol;
        address cosigner;
        address seller;
        address marketplace;
        address fallbackRoyaltyRecipient;
        address paymentMethod;
        address tokenAddress;
        uint256 tokenId;
        uint256 amount;
        uint256 itemPrice;
        uint256 expiration;
        uint256 marketplaceFeeNumerator;
        uint256 maxRoyaltyFeeNumerator;
        uint256 nonce;
        uint256 masterNonce;
    }
}

sol! {
    /// ERC-20 events and transfer entry points.
    #[sol(all_derives)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);

        function transfer(address to, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
    }
}

sol! {
    /// Wrapped native token events.
    #[sol(all_derives)]
    interface IWETH {
        event Deposit(address indexed dst, uint256 wad);
        event Withdrawal(address indexed src, uint256 wad);
    }
}

sol! {
    /// ERC-721 events.
    #[sol(all_derives)]
    interface IERC721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        event ApprovalForAll(address indexed owner, address indexed operator, bool approved);
    }
}

/// Seaport item types.
pub mod item_type {
    /// Native currency.
    pub const NATIVE: u8 = 0;
    /// ERC-20 token.
    pub const ERC20: u8 = 1;
    /// ERC-721 token.
    pub const ERC721: u8 = 2;
    /// ERC-1155 token.
    pub const ERC1155: u8 = 3;
    /// ERC-721 with criteria.
    pub const ERC721_WITH_CRITERIA: u8 = 4;
    /// ERC-1155 with criteria.
    pub const ERC1155_WITH_CRITERIA: u8 = 5;

    /// Returns true for NFT item types.
    #[must_use]
    pub const fn is_nft(item_type: u8) -> bool {
        matches!(
            item_type,
            ERC721 | ERC1155 | ERC721_WITH_CRITERIA | ERC1155_WITH_CRITERIA
        )
    }

    /// Returns true for fungible item types.
    #[must_use]
    pub const fn is_fungible(item_type: u8) -> bool {
        matches!(item_type, NATIVE | ERC20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, keccak256};
    use alloy_sol_types::{SolCall, SolEvent};

    #[test]
    fn test_transfer_topics_collide() {
        assert_eq!(IERC20::Transfer::SIGNATURE_HASH, IERC721::Transfer::SIGNATURE_HASH);
        assert_eq!(
            IERC20::Transfer::SIGNATURE_HASH,
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
    }

    #[test]
    fn test_erc20_selectors() {
        assert_eq!(IERC20::transferCall::SELECTOR, [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(IERC20::transferFromCall::SELECTOR, [0x23, 0xb8, 0x72, 0xdd]);
    }

    #[test]
    fn test_event_signatures() {
        assert_eq!(
            ISeaport::CounterIncremented::SIGNATURE_HASH,
            keccak256("CounterIncremented(uint256,address)")
        );
        assert_eq!(
            IPaymentProcessor::MasterNonceInvalidated::SIGNATURE_HASH,
            keccak256("MasterNonceInvalidated(address,uint256)")
        );
    }

    #[test]
    fn test_item_types() {
        assert!(item_type::is_nft(item_type::ERC721));
        assert!(item_type::is_nft(item_type::ERC1155_WITH_CRITERIA));
        assert!(!item_type::is_nft(item_type::ERC20));
        assert!(item_type::is_fungible(item_type::NATIVE));
    }
}
